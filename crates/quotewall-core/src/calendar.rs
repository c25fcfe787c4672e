//! Calendar-date helpers shared by the filter engine, the store and the page
//! renderer. The archive is day-granular, so everything here is a `Date`.

use time::macros::format_description;
use time::Date;

/// Parse `MM/DD/YYYY` (one or two digit month and day, four digit year).
#[must_use]
pub fn parse_us_date(raw: &str) -> Option<Date> {
    Date::parse(raw.trim(), format_description!("[month padding:none]/[day padding:none]/[year]"))
        .ok()
}

/// `M/D/YYYY`, the layout used by quote archive files.
#[must_use]
pub fn us_date(date: Date) -> String {
    date.format(format_description!("[month padding:none]/[day padding:none]/[year]"))
        .unwrap_or_else(|_| date.to_string())
}

/// `YYYY-MM-DD`, the layout stored in sqlite and used in rendered conditions.
#[must_use]
pub fn iso_date(date: Date) -> String {
    date.format(format_description!("[year]-[month]-[day]")).unwrap_or_else(|_| date.to_string())
}

#[must_use]
pub fn parse_iso_date(raw: &str) -> Option<Date> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]")).ok()
}

/// `Jan 2, 2006`, shown under each quote on the wall.
#[must_use]
pub fn display_date(date: Date) -> String {
    date.format(format_description!("[month repr:short] [day padding:none], [year]"))
        .unwrap_or_else(|_| iso_date(date))
}
