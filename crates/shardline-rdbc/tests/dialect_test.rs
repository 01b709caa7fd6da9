//! Integration tests for shardline-rdbc dialect rendering

use shardline_rdbc::prelude::*;

#[test]
fn test_point_lookup_binds_keys_then_sharding_columns() {
    let spec = SelectSpec::new(Some("ds_0"), "t_order")
        .with_predicate("user_id", Comparison::Eq)
        .with_predicate("order_id", Comparison::Eq)
        .with_predicate("tenant_id", Comparison::Eq)
        .with_order_by("user_id")
        .with_order_by("order_id");

    let sql = PostgresDialect.build_select(&spec);
    assert!(sql.contains("\"user_id\" = $1"), "{sql}");
    assert!(sql.contains("\"order_id\" = $2"), "{sql}");
    assert!(sql.contains("\"tenant_id\" = $3"), "{sql}");
    assert!(sql.contains("ORDER BY \"user_id\" ASC, \"order_id\" ASC"), "{sql}");
    assert_eq!(spec.parameter_count(), 3);
}

#[test]
fn test_inclusive_lower_bound() {
    let spec = SelectSpec::new(None, "t_order")
        .with_predicate("order_id", Comparison::Ge)
        .with_order_by("order_id");
    let sql = MySqlDialect.build_select(&spec);
    assert!(sql.contains("`order_id` >= ?"), "{sql}");
}

#[test]
fn test_unbounded_scan_has_no_where_clause() {
    let spec = SelectSpec::new(None, "t_order");
    let sql = MariaDbDialect.build_select(&spec);
    assert_eq!(sql, "SELECT * FROM `t_order`");
    assert_eq!(spec.parameter_count(), 0);
}

#[test]
fn test_dialect_matches_database_type() {
    for db in [
        DatabaseType::MySQL,
        DatabaseType::MariaDB,
        DatabaseType::PostgreSQL,
    ] {
        assert_eq!(dialect_for(db.dialect_name()).database_type(), db);
    }
}
