use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref DISALLOWED: Regex = Regex::new(r"[^a-zA-Z0-9_\-]").expect("valid table name pattern");
}

/// Physical table name for a logical provider name.
///
/// Drops a URI scheme prefix (`fabric:/journal` becomes `/journal`) and then
/// every character outside `[A-Za-z0-9_-]`. Distinct logical names may map to
/// the same physical name.
pub fn table_name_for(logical_name: &str) -> String {
    let without_scheme = match logical_name.split_once(':') {
        Some((_, rest)) => rest,
        None => logical_name,
    };
    DISALLOWED.replace_all(without_scheme, "").into_owned()
}
