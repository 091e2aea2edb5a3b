//! HTTP-date formatting and parsing (IMF-fixdate, always GMT).

use time::{
    OffsetDateTime, PrimitiveDateTime, format_description::BorrowedFormatItem,
    macros::format_description,
};

const IMF_FIXDATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Format an epoch second as an HTTP-date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
///
/// Returns `None` for timestamps outside the representable range.
pub fn format_http_date(epoch_seconds: i64) -> Option<String> {
    let datetime = OffsetDateTime::from_unix_timestamp(epoch_seconds).ok()?;
    datetime.format(IMF_FIXDATE).ok()
}

/// Parse an HTTP-date header value into epoch seconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    let parsed = PrimitiveDateTime::parse(value.trim(), IMF_FIXDATE).ok()?;
    Some(parsed.assume_utc().unix_timestamp())
}
