//! 自由入力の発話を意図に分類し、イベント集合に適用する
//!
//! 分類はキーワードの優先順位（削除 > 追加 > 照会）で決まる。
//! 外部の解釈サービスを委譲先に設定した場合はそちらの結果を使い、
//! 失敗・タイムアウト時は固定の再試行メッセージを返す。

use crate::llm::{InterpretContext, LLMRequest, LLMResponse, LLM};
use crate::models::{Action, Event, EventStore, ParsedIntent, SchedulerError};
use crate::resolver::DateTimeResolver;
use anyhow::{anyhow, Result};
use chrono::{NaiveDate, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_TITLE: &str = "새 일정";
pub const FALLBACK_MESSAGE: &str = "명령을 이해하지 못했습니다. 다시 시도해 주세요.";
pub const HELP_MESSAGE: &str = "사용 가능한 명령:\n\
• 내일 오후 3시에 회의 추가해줘\n\
• 오늘 일정 알려줘\n\
• 금요일 회의 삭제해줘\n\
• 15일 일정 모두 지워줘";

const DELETE_KEYWORDS: &[&str] = &["삭제", "지워", "지우", "취소", "제거", "delete", "remove"];
const ADD_KEYWORDS: &[&str] = &["추가", "등록", "넣어", "잡아", "만들어", "add"];
/// 動詞がなくても追加とみなす名詞（`내일 3시 미팅`）。照会より後に判定する
const ADD_TRIGGER_NOUNS: &[&str] = &["약속", "미팅"];
const QUERY_KEYWORDS: &[&str] = &[
    "조회", "알려", "보여", "확인", "뭐", "무슨", "일정", "스케줄", "list", "show",
];

/// タイトルに残さない語
const FILLER_WORDS: &[&str] = &[
    "일정", "스케줄", "새", "좀", "줘", "해줘", "주세요", "해주세요", "에", "모두", "전부", "다",
    "전체", "모든", "말고", "대신", "아니라", "아니고", "please", "all",
];

/// 削除対象の断片から落とす主格・補助助詞
const SUBJECT_PARTICLES: &[char] = &['는', '은', '가', '이', '도'];

const PUNCTUATION: &[char] = &[':', ',', '.', '!', '?', '"', '\'', '~', '(', ')'];

#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub today: NaiveDate,
    pub selected_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub intent: ParsedIntent,
    pub message: String,
}

fn contains_keyword(lower: &str, keyword: &str) -> bool {
    if keyword.is_ascii() {
        lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == keyword)
    } else {
        lower.contains(keyword)
    }
}

fn has_any(lower: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| contains_keyword(lower, k))
}

/// キーワードだけで行う分類
pub fn classify_action(utterance: &str) -> Action {
    let lower = utterance.to_lowercase();
    if has_any(&lower, DELETE_KEYWORDS) {
        Action::Delete
    } else if has_any(&lower, ADD_KEYWORDS) {
        Action::Add
    } else if has_any(&lower, QUERY_KEYWORDS) {
        Action::Query
    } else if has_any(&lower, ADD_TRIGGER_NOUNS) {
        Action::Add
    } else {
        Action::Unrecognized
    }
}

/// 日付・時刻表現とキーワードを除いた残りをタイトルとする。空なら `None`
pub fn extract_title(utterance: &str, resolver: &DateTimeResolver, keywords: &[&str]) -> Option<String> {
    let stripped = resolver.strip_expressions(utterance);

    let words: Vec<String> = stripped
        .split_whitespace()
        .filter_map(|token| {
            let token = token.trim_matches(PUNCTUATION);
            let lower = token.to_lowercase();

            // キーワード以降は捨てる（`회의추가해줘` → `회의`）
            let cut = keywords
                .iter()
                .filter_map(|k| {
                    if k.is_ascii() {
                        (lower == *k).then_some(0)
                    } else {
                        lower.find(k)
                    }
                })
                .min()
                .unwrap_or(token.len());
            let token = token.get(..cut).unwrap_or(token).trim_matches(PUNCTUATION);

            if token.is_empty() || FILLER_WORDS.contains(&token.to_lowercase().as_str()) {
                return None;
            }
            Some(strip_object_particle(token).to_string())
        })
        .collect();

    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

/// 末尾の目的格助詞を落とす。`을` は2文字語（`마을` など）では残す
fn strip_object_particle(word: &str) -> &str {
    if let Some(rest) = word.strip_suffix('를') {
        if !rest.is_empty() {
            return rest;
        }
    }
    if word.chars().count() >= 3 {
        if let Some(rest) = word.strip_suffix('을') {
            return rest;
        }
    }
    word
}

/// `회의는`, `회의가`, `회의도` の助詞を落とす。2文字以下の語は残す
fn strip_subject_particle(word: &str) -> &str {
    if word.chars().count() < 3 {
        return word;
    }
    word.strip_suffix(SUBJECT_PARTICLES).unwrap_or(word)
}

/// ローカルのキーワード解釈
pub fn classify(utterance: &str, resolver: &DateTimeResolver, today: NaiveDate) -> ParsedIntent {
    let action = classify_action(utterance);
    if action == Action::Unrecognized {
        return ParsedIntent::unrecognized();
    }

    let date_expression = resolver.match_date(utterance, today).map(|m| m.expression);
    let (title, time) = match action {
        Action::Add => (
            extract_title(utterance, resolver, ADD_KEYWORDS),
            resolver.resolve_time(utterance),
        ),
        Action::Delete => {
            let fragment = extract_title(utterance, resolver, DELETE_KEYWORDS).map(|title| {
                title
                    .split(' ')
                    .map(strip_subject_particle)
                    .collect::<Vec<_>>()
                    .join(" ")
            });
            (fragment, None)
        }
        _ => (None, None),
    };

    ParsedIntent {
        action,
        date_expression,
        title,
        time,
    }
}

pub struct CommandInterpreter {
    resolver: DateTimeResolver,
    delegate: Option<Arc<dyn LLM>>,
    timeout: Duration,
    default_time: Option<NaiveTime>,
}

impl CommandInterpreter {
    pub fn new(resolver: DateTimeResolver) -> Self {
        Self {
            resolver,
            delegate: None,
            timeout: Duration::from_secs(5),
            default_time: None,
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn LLM>, timeout: Duration) -> Self {
        self.delegate = Some(delegate);
        self.timeout = timeout;
        self
    }

    pub fn with_default_time(mut self, default_time: Option<NaiveTime>) -> Self {
        self.default_time = default_time;
        self
    }

    pub fn resolver(&self) -> &DateTimeResolver {
        &self.resolver
    }

    pub fn is_delegating(&self) -> bool {
        self.delegate.is_some()
    }

    /// 委譲先への疎通確認。委譲していなければ何もしない
    pub async fn check_delegate(&self) -> Result<()> {
        match &self.delegate {
            None => Ok(()),
            Some(llm) => tokio::time::timeout(self.timeout, llm.test_connection())
                .await
                .map_err(|_| anyhow!("connection check timed out after {:?}", self.timeout))?,
        }
    }

    /// 1回の発話を処理する。委譲先の失敗はエラーにせず固定メッセージで返す
    pub async fn handle(
        &self,
        utterance: &str,
        ctx: &SessionContext,
        store: &mut dyn EventStore,
    ) -> Result<Reply> {
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return Err(SchedulerError::EmptyUtterance.into());
        }

        let (intent, delegated_text) = match &self.delegate {
            None => (classify(utterance, &self.resolver, ctx.today), None),
            Some(llm) => {
                // await をまたいでストアを借用しない
                let events = store.list_by_date(ctx.selected_date);
                match self.delegate_intent(llm.as_ref(), utterance, ctx, events).await {
                    Ok(response) => (response.intent, response.response_text),
                    Err(e) => {
                        warn!(error = %e, "解釈サービスの呼び出しに失敗");
                        return Ok(Reply {
                            intent: ParsedIntent::unrecognized(),
                            message: FALLBACK_MESSAGE.to_string(),
                        });
                    }
                }
            }
        };

        info!(action = ?intent.action, date = ?intent.date_expression, title = ?intent.title, "発話を解釈");
        let message = self.apply(&intent, delegated_text, ctx, store)?;
        Ok(Reply { intent, message })
    }

    async fn delegate_intent(
        &self,
        llm: &dyn LLM,
        utterance: &str,
        ctx: &SessionContext,
        events: Vec<Event>,
    ) -> Result<LLMResponse> {
        let request = LLMRequest {
            user_input: utterance.to_string(),
            context: InterpretContext {
                today: ctx.today,
                selected_date: ctx.selected_date,
                events,
            },
        };

        tokio::time::timeout(self.timeout, llm.interpret(request))
            .await
            .map_err(|_| anyhow!("interpretation timed out after {:?}", self.timeout))?
    }

    /// 対象日付。解決できなければ選択中の日付
    pub fn target_date(&self, intent: &ParsedIntent, ctx: &SessionContext) -> NaiveDate {
        intent
            .date_expression
            .as_deref()
            .and_then(|expr| self.resolver.resolve_date(expr, ctx.today))
            .unwrap_or(ctx.selected_date)
    }

    fn apply(
        &self,
        intent: &ParsedIntent,
        delegated_text: Option<String>,
        ctx: &SessionContext,
        store: &mut dyn EventStore,
    ) -> Result<String> {
        match intent.action {
            Action::Add => self.apply_add(intent, ctx, store),
            Action::Query => Ok(self.apply_query(intent, ctx, &*store)),
            Action::Delete => self.apply_delete(intent, ctx, store),
            Action::Unrecognized => Ok(delegated_text.unwrap_or_else(|| HELP_MESSAGE.to_string())),
        }
    }

    fn apply_add(&self, intent: &ParsedIntent, ctx: &SessionContext, store: &mut dyn EventStore) -> Result<String> {
        let date = self.target_date(intent, ctx);
        let title = intent
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TITLE);
        let time = intent.time.or(self.default_time);

        let event = store.add(Event::new(title, date)?.with_time(time))?;
        debug!(id = %event.id, "イベントを追加");

        Ok(format!(
            "'{}' 일정을 추가했습니다 ({}, {})",
            event.title,
            event.date.format("%Y-%m-%d"),
            event.time_label()
        ))
    }

    fn apply_query(&self, intent: &ParsedIntent, ctx: &SessionContext, store: &dyn EventStore) -> String {
        let date = self.target_date(intent, ctx);
        let mut events = store.list_by_date(date);
        if events.is_empty() {
            return format!("{}에는 일정이 없습니다", date.format("%Y-%m-%d"));
        }

        // 終日を先頭に、あとは時刻順
        events.sort_by_key(|e| e.time);

        let lines = events
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let mark = if e.completed { " ✓" } else { "" };
                format!("{}. {} ({}){}", i + 1, e.title, e.time_label(), mark)
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!("{} 일정:\n{}", date.format("%Y-%m-%d"), lines)
    }

    fn apply_delete(&self, intent: &ParsedIntent, ctx: &SessionContext, store: &mut dyn EventStore) -> Result<String> {
        let date = self.target_date(intent, ctx);
        let date_label = date.format("%Y-%m-%d");
        let fragment = intent
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let targets: Vec<Event> = match fragment {
            Some(fragment) => {
                let needle = fragment.to_lowercase();
                store
                    .list_by_date(date)
                    .into_iter()
                    .filter(|e| e.title.to_lowercase().contains(&needle))
                    .collect()
            }
            None => store.list_by_date(date),
        };

        if targets.is_empty() {
            return Ok(match fragment {
                Some(fragment) => format!("{}에 '{}' 일정이 없습니다", date_label, fragment),
                None => format!("{}에 삭제할 일정이 없습니다", date_label),
            });
        }

        let mut removed = 0;
        for event in &targets {
            if store.remove(event.id)? {
                removed += 1;
            }
        }
        debug!(removed, "イベントを削除");

        Ok(format!("{} 일정 {}개를 삭제했습니다", date_label, removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> DateTimeResolver {
        DateTimeResolver::default()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    #[test]
    fn test_keyword_priority() {
        assert_eq!(classify_action("내일 일정 추가하고 삭제해줘"), Action::Delete);
        assert_eq!(classify_action("회의 등록해줘"), Action::Add);
        assert_eq!(classify_action("오늘 일정 추가"), Action::Add);
        assert_eq!(classify_action("오늘 일정"), Action::Query);
        assert_eq!(classify_action("내일 뭐 있어?"), Action::Query);
        assert_eq!(classify_action("안녕"), Action::Unrecognized);
    }

    #[test]
    fn test_english_keywords_match_whole_words() {
        assert_eq!(classify_action("add lunch tomorrow"), Action::Add);
        assert_eq!(classify_action("my address"), Action::Unrecognized);
        assert_eq!(classify_action("Remove standup"), Action::Delete);
    }

    #[test]
    fn test_extract_title() {
        let r = resolver();
        assert_eq!(extract_title("내일 3시에 회의 추가해줘", &r, ADD_KEYWORDS).as_deref(), Some("회의"));
        assert_eq!(extract_title("일정 추가: 팀 회의 3시", &r, ADD_KEYWORDS).as_deref(), Some("팀 회의"));
        assert_eq!(extract_title("금요일 저녁 약속을 등록", &r, ADD_KEYWORDS).as_deref(), Some("저녁 약속"));
        assert_eq!(extract_title("모레 회의를추가해줘", &r, ADD_KEYWORDS).as_deref(), Some("회의"));
        assert_eq!(extract_title("마을 축제 추가", &r, ADD_KEYWORDS).as_deref(), Some("마을 축제"));
        assert_eq!(extract_title("내일 일정 추가해줘", &r, ADD_KEYWORDS), None);
        assert_eq!(extract_title("내일 일정 모두 삭제해줘", &r, DELETE_KEYWORDS), None);
    }

    #[test]
    fn test_classify_add() {
        let intent = classify("내일 오후 3시에 회의 추가해줘", &resolver(), today());
        assert_eq!(intent.action, Action::Add);
        assert_eq!(intent.date_expression.as_deref(), Some("내일"));
        assert_eq!(intent.title.as_deref(), Some("회의"));
        assert_eq!(intent.time, NaiveTime::from_hms_opt(15, 0, 0));
    }

    #[test]
    fn test_classify_query_has_no_title() {
        let intent = classify("금요일 일정 알려줘", &resolver(), today());
        assert_eq!(intent.action, Action::Query);
        assert_eq!(intent.date_expression.as_deref(), Some("금요일"));
        assert_eq!(intent.title, None);
        assert_eq!(intent.time, None);
    }

    #[test]
    fn test_appointment_nouns_classify_as_add() {
        assert_eq!(classify_action("내일 3시 미팅"), Action::Add);
        assert_eq!(classify_action("금요일 저녁 약속"), Action::Add);
        assert_eq!(classify_action("내일 약속 알려줘"), Action::Query);
        assert_eq!(classify_action("내일 미팅 취소해줘"), Action::Delete);
    }

    #[test]
    fn test_delete_fragment_drops_subject_particles() {
        for utterance in ["내일 회의는 취소해줘", "내일 회의가 취소됐어", "내일 회의도 지워줘"] {
            let intent = classify(utterance, &resolver(), today());
            assert_eq!(intent.action, Action::Delete, "{}", utterance);
            assert_eq!(intent.title.as_deref(), Some("회의"), "{}", utterance);
        }
        assert_eq!(strip_subject_particle("팀은"), "팀은");
    }

    #[test]
    fn test_classify_unrecognized() {
        assert_eq!(classify("안녕", &resolver(), today()), ParsedIntent::unrecognized());
    }
}
