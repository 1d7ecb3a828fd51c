//! Date-partitioned object keys.
//!
//! Output files are laid out as `<table>/<YYYY>/<MM>/<DD>.<ext>`, so a
//! second run on the same calendar day overwrites the first.

use chrono::NaiveDate;
use object_store::path::Path;

/// Key template for a daily output file, in strftime syntax.
const DATE_TEMPLATE: &str = "%Y/%m/%d";

/// Build the object key for `table` on `date`.
///
/// Schema-qualified names keep their dot (`public.orders/2024/...`), which
/// keeps distinct schemas in distinct prefixes.
pub fn date_path(table: &str, date: NaiveDate, extension: &str) -> Path {
    let stem = date.format(DATE_TEMPLATE).to_string();
    Path::from(format!("{table}/{stem}.{extension}"))
}
