//! Timeframe filters for recall.
//!
//! A hand-written recursive descent over a closed grammar: calendar days,
//! explicit intervals, and a small set of natural-language phrases
//! ("yesterday", "last week", "few days ago" where few = 3, "last weekend",
//! "N weekends ago"). `Auto` extracts the time expression from the query
//! text and hands back the cleaned remainder. All intervals are half-open
//! `[start, end)` over UTC; a list of intervals ORs.

use crate::config::WeekStart;
use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

/// A resolved time filter: one or more half-open UTC intervals.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Timeframe {
    /// OR-ed `[start, end)` intervals.
    pub intervals: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Timeframe {
    /// A single interval.
    #[must_use]
    pub fn interval(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            intervals: vec![(start, end)],
        }
    }

    /// The whole calendar day containing `date`.
    #[must_use]
    pub fn day(date: NaiveDate) -> Self {
        Self::interval(day_start(date), day_start(date + Days::new(1)))
    }

    /// Union of several timeframes.
    #[must_use]
    pub fn union(frames: impl IntoIterator<Item = Timeframe>) -> Self {
        Self {
            intervals: frames.into_iter().flat_map(|f| f.intervals).collect(),
        }
    }

    /// Whether `at` falls inside any interval.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.intervals
            .iter()
            .any(|(start, end)| at >= *start && at < *end)
    }
}

/// A timeframe as accepted by the recall API, before resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeframeSpec {
    /// One calendar day.
    Date(NaiveDate),
    /// The calendar day containing this instant.
    DateTime(DateTime<Utc>),
    /// An explicit `[start, end)` interval.
    Interval(DateTime<Utc>, DateTime<Utc>),
    /// A natural-language phrase from the closed grammar.
    Natural(String),
    /// Extract the time expression from the query text.
    Auto,
    /// OR of several specs.
    Any(Vec<TimeframeSpec>),
}

/// Outcome of resolving a [`TimeframeSpec`] against a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTimeframe {
    /// The time filter, when one applies.
    pub timeframe: Option<Timeframe>,
    /// The query with any extracted time expression removed (`Auto` only;
    /// other specs pass the query through unchanged).
    pub query: String,
}

/// Resolve a spec against `query` at the current instant.
pub fn resolve(
    spec: Option<&TimeframeSpec>,
    query: &str,
    week_start: WeekStart,
) -> Result<ResolvedTimeframe> {
    resolve_at(spec, query, week_start, Utc::now())
}

/// Resolve a spec at a fixed instant. Exposed for deterministic tests.
pub fn resolve_at(
    spec: Option<&TimeframeSpec>,
    query: &str,
    week_start: WeekStart,
    now: DateTime<Utc>,
) -> Result<ResolvedTimeframe> {
    let Some(spec) = spec else {
        return Ok(ResolvedTimeframe {
            timeframe: None,
            query: query.to_string(),
        });
    };

    match spec {
        TimeframeSpec::Date(date) => Ok(ResolvedTimeframe {
            timeframe: Some(Timeframe::day(*date)),
            query: query.to_string(),
        }),
        TimeframeSpec::DateTime(at) => Ok(ResolvedTimeframe {
            timeframe: Some(Timeframe::day(at.date_naive())),
            query: query.to_string(),
        }),
        TimeframeSpec::Interval(start, end) => {
            if start >= end {
                return Err(Error::Validation(format!(
                    "timeframe start {start} is not before end {end}"
                )));
            }
            Ok(ResolvedTimeframe {
                timeframe: Some(Timeframe::interval(*start, *end)),
                query: query.to_string(),
            })
        }
        TimeframeSpec::Natural(phrase) => {
            let words: Vec<String> = normalize_words(phrase);
            match match_phrase(&words, 0, week_start, now) {
                Some((len, frame)) if len == words.len() => Ok(ResolvedTimeframe {
                    timeframe: Some(frame),
                    query: query.to_string(),
                }),
                _ => Err(Error::Validation(format!(
                    "unrecognized timeframe expression: {phrase:?}"
                ))),
            }
        }
        TimeframeSpec::Auto => {
            let (cleaned, frame) = extract_auto(query, week_start, now);
            Ok(ResolvedTimeframe {
                timeframe: frame,
                query: cleaned,
            })
        }
        TimeframeSpec::Any(specs) => {
            let mut intervals = Vec::new();
            for inner in specs {
                let resolved = resolve_at(Some(inner), query, week_start, now)?;
                if let Some(frame) = resolved.timeframe {
                    intervals.extend(frame.intervals);
                }
            }
            Ok(ResolvedTimeframe {
                timeframe: (!intervals.is_empty()).then_some(Timeframe { intervals }),
                query: query.to_string(),
            })
        }
    }
}

/// Scan `query` for the first time expression; return the cleaned query
/// and the parsed interval, or the query unchanged when nothing matches.
pub fn extract_auto(
    query: &str,
    week_start: WeekStart,
    now: DateTime<Utc>,
) -> (String, Option<Timeframe>) {
    let raw_words: Vec<&str> = query.split_whitespace().collect();
    let words = normalize_words(query);

    for start in 0..words.len() {
        if let Some((len, frame)) = match_phrase(&words, start, week_start, now) {
            let cleaned: Vec<&str> = raw_words
                .iter()
                .enumerate()
                .filter(|(i, _)| *i < start || *i >= start + len)
                .map(|(_, w)| *w)
                .collect();
            return (cleaned.join(" "), Some(frame));
        }
    }
    (query.to_string(), None)
}

fn normalize_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .collect()
}

/// Try to match one grammar phrase starting at `words[at]`.
///
/// Returns the number of words consumed and the resolved interval.
fn match_phrase(
    words: &[String],
    at: usize,
    week_start: WeekStart,
    now: DateTime<Utc>,
) -> Option<(usize, Timeframe)> {
    let word = |i: usize| words.get(at + i).map(String::as_str);
    let today = now.date_naive();

    match word(0)? {
        "today" => return Some((1, Timeframe::day(today))),
        "yesterday" => return Some((1, Timeframe::day(today - Days::new(1)))),
        "last" => match word(1) {
            Some("week") => return Some((2, week_interval(today, week_start, 1))),
            Some("month") => return Some((2, month_interval(today, 1))),
            Some("weekend") => return Some((2, weekend_interval(today, 1))),
            _ => {}
        },
        "this" => match word(1) {
            Some("week") => return Some((2, week_interval(today, week_start, 0))),
            Some("month") => return Some((2, month_interval(today, 0))),
            _ => {}
        },
        _ => {}
    }

    // "<count> <unit> ago", with "a" allowed before "few"/"couple"
    let (count_len, count) = match word(0)? {
        "a" => (2, parse_count(word(1)?)?),
        first => (1, parse_count(first)?),
    };
    let unit = word(count_len)?;
    if word(count_len + 1)? != "ago" {
        return None;
    }
    let consumed = count_len + 2;
    let count = count.max(1);

    let frame = match unit {
        "day" | "days" => Timeframe::day(today - Days::new(count)),
        "week" | "weeks" => week_interval(today, week_start, count),
        "month" | "months" => month_interval(today, count),
        "weekend" | "weekends" => weekend_interval(today, count),
        _ => return None,
    };
    Some((consumed, frame))
}

fn parse_count(word: &str) -> Option<u64> {
    if let Ok(n) = word.parse::<u64>() {
        return Some(n);
    }
    Some(match word {
        "couple" => 2,
        "few" => 3,
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        _ => return None,
    })
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    match date.and_hms_opt(0, 0, 0) {
        Some(at_midnight) => at_midnight.and_utc(),
        None => DateTime::<Utc>::MIN_UTC,
    }
}

fn start_of_week(date: NaiveDate, week_start: WeekStart) -> NaiveDate {
    let offset = match week_start {
        WeekStart::Monday => u64::from(date.weekday().num_days_from_monday()),
        WeekStart::Sunday => u64::from(date.weekday().num_days_from_sunday()),
    };
    date - Days::new(offset)
}

/// The calendar week `weeks_back` weeks before the one containing `today`.
/// Zero means the current week.
fn week_interval(today: NaiveDate, week_start: WeekStart, weeks_back: u64) -> Timeframe {
    let start = start_of_week(today, week_start) - Days::new(7 * weeks_back);
    Timeframe::interval(day_start(start), day_start(start + Days::new(7)))
}

/// The calendar month `months_back` months before the one containing
/// `today`. Zero means the current month.
fn month_interval(today: NaiveDate, months_back: u64) -> Timeframe {
    let total = today.year() as i64 * 12 + i64::from(today.month0()) - months_back as i64;
    let (year, month0) = (total.div_euclid(12), total.rem_euclid(12));
    let start = NaiveDate::from_ymd_opt(year as i32, month0 as u32 + 1, 1).unwrap_or(today);
    let next = month0 + 1;
    let end = NaiveDate::from_ymd_opt(
        (total + 1).div_euclid(12) as i32,
        (next.rem_euclid(12)) as u32 + 1,
        1,
    )
    .unwrap_or(start);
    Timeframe::interval(day_start(start), day_start(end))
}

/// The Saturday-Sunday pair `weekends_back` weekends before now; 1 means
/// the most recently completed weekend.
fn weekend_interval(today: NaiveDate, weekends_back: u64) -> Timeframe {
    let days_since_saturday = u64::from((today.weekday().num_days_from_sunday() + 1) % 7);
    let mut saturday = today - Days::new(days_since_saturday);
    // A weekend still in progress does not count as "last weekend"
    if days_since_saturday < 2 {
        saturday = saturday - Days::new(7);
    }
    saturday = saturday - Days::new(7 * (weekends_back.saturating_sub(1)));
    Timeframe::interval(day_start(saturday), day_start(saturday + Days::new(2)))
}
