//! Identifier validation for generated SQL.
//!
//! Table, schema and key column names come from job configuration and are
//! rendered into scan queries, so every name is checked before use. Values
//! are always bound as parameters and never interpolated.

use crate::error::Error;

/// Validate a SQL identifier (schema, table or column name).
///
/// Rules:
/// - Must not be empty
/// - Maximum 255 characters
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters, `_` and `$`
///
/// # Examples
///
/// ```
/// use shardline_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("t_order").is_ok());
/// assert!(validate_sql_identifier("ds_0").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE t_order--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("1abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 255 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 255)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '$') {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Validate every identifier in a list, reporting the first bad one.
pub fn validate_sql_identifiers<'a>(names: impl IntoIterator<Item = &'a str>) -> crate::Result<()> {
    names.into_iter().try_for_each(validate_sql_identifier)
}
