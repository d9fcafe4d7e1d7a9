use chrono::{DateTime, FixedOffset, SecondsFormat, TimeDelta};
use rocket::serde::{Deserialize, Serialize};

/// Timestamp stored as RFC3339-style TEXT in SQLite.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Copy)]
pub struct FdDateTime(pub DateTime<FixedOffset>);
impl FdDateTime {
    pub fn now() -> Self {
        Self::from_fixed_offset(chrono::Local::now().fixed_offset())
    }
    pub fn from_fixed_offset(datetime: DateTime<FixedOffset>) -> FdDateTime {
        let millis = datetime.timestamp_subsec_millis();
        let nanos = datetime.timestamp_subsec_nanos() - millis * 1_000_000;
        if let Some(dt) = datetime.checked_sub_signed(TimeDelta::nanoseconds(nanos as i64)) {
            FdDateTime(dt)
        } else {
            FdDateTime(datetime)
        }
    }
    pub fn trimmed_to_sec(&self) -> Self {
        let nanos = self.0.timestamp_subsec_nanos();
        if let Some(dt) = self.0.checked_sub_signed(TimeDelta::nanoseconds(nanos as i64)) {
            FdDateTime(dt)
        } else {
            *self
        }
    }
    pub fn date(&self) -> chrono::NaiveDate {
        self.0.date_naive()
    }
    pub(crate) fn to_iso_string(self) -> String {
        if self.0.timestamp_subsec_millis() == 0 {
            self.0.to_rfc3339_opts(SecondsFormat::Secs, true)
        } else {
            self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
        }
    }
    pub(crate) fn from_iso_string(datetime_str: &str) -> Result<Self, anyhow::Error> {
        let dt = DateTime::parse_from_rfc3339(datetime_str)?;
        Ok(Self::from_fixed_offset(dt))
    }
}

impl<DB: sqlx::Database> sqlx::Type<DB> for FdDateTime
where
    str: sqlx::Type<DB>,
{
    fn type_info() -> <DB as sqlx::Database>::TypeInfo {
        // TEXT columns only
        <&str as sqlx::Type<DB>>::type_info()
    }
}
impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for FdDateTime
where
    &'r str: sqlx::Decode<'r, DB>,
{
    fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let value = <&str as sqlx::Decode<DB>>::decode(value)?;
        let res = FdDateTime::from_iso_string(value);
        Ok(res?)
    }
}

#[test]
fn test_trimmed_to_sec() {
    let dt = FdDateTime::now().trimmed_to_sec();
    assert_eq!(dt.0.timestamp_subsec_nanos(), 0);
}

#[test]
fn test_parse_fdatetime() {
    for (dtstr, dtstr2) in &[
        ("1970-03-05 14:32:45+00:00", "1970-03-05T14:32:45Z"),
        ("2025-03-05T14:32:45Z", "2025-03-05T14:32:45Z"),
        ("2025-03-05 14:32:45+10:00", "2025-03-05T14:32:45+10:00"),
        ("2025-03-05T14:32:45-01:30", "2025-03-05T14:32:45-01:30"),
        ("2025-03-17T20:45:38.565293063+01:00", "2025-03-17T20:45:38.565+01:00"),
        ("2025-03-17T21:27:04.095+01:00", "2025-03-17T21:27:04.095+01:00"),
    ] {
        let dt = FdDateTime::from_iso_string(dtstr)
            .map_err(|e| println!("parse {dtstr} error: {e}")).unwrap();
        assert_eq!(&dt.to_iso_string(), dtstr2)
    }
}
