//! 韓国語の日付・時刻表現を具体的な値に解決する
//!
//! ルールは優先順位順のテーブルとして保持し、最初に一致したものを採用する。
//! 一致したルールの値が不正（`2월 30일` など）な場合は「未解決」とし、
//! 後続のルールは参照しない。

use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use regex::{Captures, Regex};
use std::sync::OnceLock;
use tracing::debug;

/// 日付・時刻表現の直後に付く助詞
const PARTICLES: &str = r"(?:에는|에|은|는|의|까지|부터)?";

const WEEKDAYS: [char; 7] = ['일', '월', '화', '수', '목', '금', '토'];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverOptions {
    /// 過ぎた `M월 D일` を翌年に繰り越すか
    pub roll_month_day_to_next_year: bool,
    /// `오전`/`오후` がないとき、この時刻以下（1時以上）を午後とみなす
    pub implicit_afternoon_until: Option<u32>,
}

/// 日付ルールの一致結果。`date` が `None` なら一致はしたが値が不正
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateMatch {
    pub rule: &'static str,
    pub expression: String,
    pub date: Option<NaiveDate>,
}

type DateFn = fn(&Captures, NaiveDate, &ResolverOptions) -> Option<NaiveDate>;
type TimeFn = fn(&Captures, &str, &ResolverOptions) -> Option<NaiveTime>;

struct DateRule {
    name: &'static str,
    pattern: Regex,
    skip: fn(&Captures) -> bool,
    resolve: DateFn,
}

fn never(_: &Captures) -> bool {
    false
}

/// 直前の表現を打ち消す語（`오늘 말고 내일`）
const CORRECTION_MARKERS: &[&str] = &["말고", "대신", "아니라", "아니고"];

struct TimeRule {
    name: &'static str,
    pattern: Regex,
    skip: fn(&Captures) -> bool,
    resolve: TimeFn,
}

fn rule_regex(core: &str) -> Regex {
    Regex::new(&format!("(?i)(?:{}){}", core, PARTICLES)).expect("invalid resolver pattern")
}

fn date_rules() -> &'static [DateRule] {
    static RULES: OnceLock<Vec<DateRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            DateRule {
                name: "today",
                pattern: rule_regex(r"오늘|today"),
                skip: never,
                resolve: |_, today, _| Some(today),
            },
            DateRule {
                // 내일모레 / day after tomorrow は明後日
                name: "tomorrow",
                pattern: rule_regex(r"내일(모레)?|(day\s+after\s+)?tomorrow"),
                skip: never,
                resolve: |caps, today, _| {
                    let days = if caps.get(1).is_some() || caps.get(2).is_some() {
                        2
                    } else {
                        1
                    };
                    today.checked_add_signed(Duration::days(days))
                },
            },
            DateRule {
                name: "day_after_tomorrow",
                pattern: rule_regex(r"모레"),
                skip: never,
                resolve: |_, today, _| today.checked_add_signed(Duration::days(2)),
            },
            DateRule {
                name: "month_day",
                pattern: rule_regex(r"(?:(\d{4})\s*년\s*)?(\d{1,2})월\s*(\d{1,2})일"),
                skip: never,
                resolve: resolve_month_day,
            },
            DateRule {
                name: "iso_date",
                pattern: rule_regex(r"(\d{4})-(\d{1,2})-(\d{1,2})"),
                skip: never,
                resolve: |caps, _, _| {
                    NaiveDate::from_ymd_opt(
                        caps[1].parse().ok()?,
                        caps[2].parse().ok()?,
                        caps[3].parse().ok()?,
                    )
                },
            },
            DateRule {
                name: "weekday",
                pattern: rule_regex(
                    r"(?:(이번\s*주|금주)|(다음\s*주|담주|차주))?\s*([월화수목금토일])요일",
                ),
                skip: never,
                resolve: resolve_weekday,
            },
            DateRule {
                name: "days_later",
                pattern: rule_regex(r"(\d{1,3})\s*일\s*(?:후|뒤)"),
                skip: never,
                resolve: |caps, today, _| {
                    let days: i64 = caps[1].parse().ok()?;
                    today.checked_add_signed(Duration::days(days))
                },
            },
            DateRule {
                name: "day_of_month",
                pattern: rule_regex(r"(\d{1,2})일(\s*(?:간|동안))?"),
                // `3일간` は期間であって日付ではない
                skip: |caps| caps.get(2).is_some(),
                resolve: resolve_day_of_month,
            },
        ]
    })
}

fn time_rules() -> &'static [TimeRule] {
    static RULES: OnceLock<Vec<TimeRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            TimeRule {
                name: "korean_hour",
                pattern: rule_regex(r"(?:(오전|오후)\s*)?(\d{1,2})\s*시(간)?(?:\s*(\d{1,2})\s*분|\s*(반))?"),
                // `3시간` は所要時間であって時刻ではない
                skip: |caps| caps.get(3).is_some(),
                resolve: |caps, text, options| {
                    let hour: u32 = caps[2].parse().ok()?;
                    let minute: u32 = match (caps.get(4), caps.get(5)) {
                        (Some(m), _) => m.as_str().parse().ok()?,
                        (None, Some(_)) => 30,
                        _ => 0,
                    };
                    to_clock(hour, minute, meridiem(caps.get(1).map(|m| m.as_str()), text), options)
                },
            },
            TimeRule {
                name: "colon",
                pattern: rule_regex(r"(?:(오전|오후)\s*)?(\d{1,2}):(\d{2})"),
                skip: |_| false,
                resolve: |caps, text, options| {
                    let hour: u32 = caps[2].parse().ok()?;
                    let minute: u32 = caps[3].parse().ok()?;
                    to_clock(hour, minute, meridiem(caps.get(1).map(|m| m.as_str()), text), options)
                },
            },
        ]
    })
}

fn resolve_month_day(caps: &Captures, today: NaiveDate, options: &ResolverOptions) -> Option<NaiveDate> {
    let explicit_year: Option<i32> = match caps.get(1) {
        Some(y) => Some(y.as_str().parse().ok()?),
        None => None,
    };
    let month: u32 = caps[2].parse().ok()?;
    let day: u32 = caps[3].parse().ok()?;

    let date = NaiveDate::from_ymd_opt(explicit_year.unwrap_or(today.year()), month, day)?;
    if explicit_year.is_none() && options.roll_month_day_to_next_year && date < today {
        return NaiveDate::from_ymd_opt(today.year() + 1, month, day);
    }
    Some(date)
}

fn resolve_weekday(caps: &Captures, today: NaiveDate, _: &ResolverOptions) -> Option<NaiveDate> {
    let target_char = caps[3].chars().next()?;
    let target = WEEKDAYS.iter().position(|&c| c == target_char)? as i64;
    let current = today.weekday().num_days_from_sunday() as i64;
    let next_week = caps.get(2).is_some();

    let mut offset = target - current;
    if target <= current || next_week {
        offset += 7;
    }
    today.checked_add_signed(Duration::days(offset))
}

fn resolve_day_of_month(caps: &Captures, today: NaiveDate, _: &ResolverOptions) -> Option<NaiveDate> {
    let day: u32 = caps[1].parse().ok()?;

    if let Some(candidate) = NaiveDate::from_ymd_opt(today.year(), today.month(), day) {
        if candidate >= today {
            return Some(candidate);
        }
    }

    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
    Unspecified,
}

/// 直前の修飾語を優先し、なければ文中の `오후` を見る
fn meridiem(captured: Option<&str>, text: &str) -> Meridiem {
    match captured {
        Some("오전") => Meridiem::Am,
        Some("오후") => Meridiem::Pm,
        _ if text.contains("오후") => Meridiem::Pm,
        _ => Meridiem::Unspecified,
    }
}

fn to_clock(hour: u32, minute: u32, meridiem: Meridiem, options: &ResolverOptions) -> Option<NaiveTime> {
    let hour = match meridiem {
        Meridiem::Pm if hour < 12 => hour + 12,
        Meridiem::Am if hour == 12 => 0,
        Meridiem::Unspecified
            if options
                .implicit_afternoon_until
                .map_or(false, |limit| (1..=limit).contains(&hour) && hour < 12) =>
        {
            hour + 12
        }
        _ => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

#[derive(Debug, Clone, Default)]
pub struct DateTimeResolver {
    options: ResolverOptions,
}

impl DateTimeResolver {
    pub fn new(options: ResolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// 最初に一致した日付ルールとその表現を返す。
    /// 打ち消し語（`말고`, `대신`）があれば、その後ろの表現を優先する
    pub fn match_date(&self, text: &str, today: NaiveDate) -> Option<DateMatch> {
        correction_tail(text)
            .and_then(|tail| self.match_date_in(tail, today))
            .or_else(|| self.match_date_in(text, today))
    }

    fn match_date_in(&self, text: &str, today: NaiveDate) -> Option<DateMatch> {
        for rule in date_rules() {
            let found = rule
                .pattern
                .captures_iter(text)
                .find(|caps| !(rule.skip)(caps));
            if let Some(caps) = found {
                let date = (rule.resolve)(&caps, today, &self.options);
                debug!(rule = rule.name, ?date, "日付ルールに一致");
                return Some(DateMatch {
                    rule: rule.name,
                    expression: caps[0].trim().to_string(),
                    date,
                });
            }
        }
        None
    }

    pub fn resolve_date(&self, text: &str, today: NaiveDate) -> Option<NaiveDate> {
        self.match_date(text, today).and_then(|m| m.date)
    }

    /// 時刻表現がなければ `None`（終日）。既定時刻の補完は呼び出し側で行う
    pub fn resolve_time(&self, text: &str) -> Option<NaiveTime> {
        for rule in time_rules() {
            let found = rule
                .pattern
                .captures_iter(text)
                .find(|caps| !(rule.skip)(caps));
            if let Some(caps) = found {
                let time = (rule.resolve)(&caps, text, &self.options);
                debug!(rule = rule.name, ?time, "時刻ルールに一致");
                return time;
            }
        }
        None
    }

    /// 日付・時刻表現をすべて取り除いた残りの文字列
    pub fn strip_expressions(&self, text: &str) -> String {
        let mut stripped = text.to_string();
        for rule in date_rules() {
            stripped = strip_rule(&rule.pattern, rule.skip, &stripped);
        }
        for rule in time_rules() {
            stripped = strip_rule(&rule.pattern, rule.skip, &stripped);
        }
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

fn strip_rule(pattern: &Regex, skip: fn(&Captures) -> bool, text: &str) -> String {
    pattern
        .replace_all(text, |caps: &Captures| {
            if skip(caps) {
                caps[0].to_string()
            } else {
                " ".to_string()
            }
        })
        .into_owned()
}

/// 最後の打ち消し語より後ろの部分
fn correction_tail(text: &str) -> Option<&str> {
    CORRECTION_MARKERS
        .iter()
        .filter_map(|marker| text.rfind(marker).map(|i| i + marker.len()))
        .max()
        .map(|start| &text[start..])
}
