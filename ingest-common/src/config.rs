//! Value types shared by the `Envconfig` structs of the api and the worker.
use std::str::FromStr;
use std::time;

/// Smallest and largest accepted page size for seen-key queries.
pub const MIN_QUERY_LIMIT: u32 = 1;
pub const MAX_QUERY_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Clamp a requested page size into `[MIN_QUERY_LIMIT, MAX_QUERY_LIMIT]`.
pub fn clamp_query_limit(requested: i64) -> u32 {
    let clamped = requested.clamp(i64::from(MIN_QUERY_LIMIT), i64::from(MAX_QUERY_LIMIT));
    u32::try_from(clamped).unwrap_or(MAX_QUERY_LIMIT)
}

/// A page size read from the environment. Out of range values are clamped, not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimit(pub u32);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseQueryLimitError;

impl FromStr for QueryLimit {
    type Err = ParseQueryLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requested = s.trim().parse::<i64>().map_err(|_| ParseQueryLimitError)?;

        Ok(QueryLimit(clamp_query_limit(requested)))
    }
}

/// A count that must be at least one, such as rows per INSERT statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonZeroCount(pub usize);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseNonZeroCountError;

impl FromStr for NonZeroCount {
    type Err = ParseNonZeroCountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<usize>() {
            Ok(0) | Err(_) => Err(ParseNonZeroCountError),
            Ok(count) => Ok(NonZeroCount(count)),
        }
    }
}
