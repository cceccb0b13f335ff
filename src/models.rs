use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// 終日イベントの表示ラベル
pub const ALL_DAY_LABEL: &str = "종일";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub date: NaiveDate,
    pub title: String,
    #[serde(default, with = "hhmm")]
    pub time: Option<NaiveTime>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// タイトルは前後の空白を除去し、空の場合は作成を拒否する
    pub fn new(title: impl Into<String>, date: NaiveDate) -> Result<Self, SchedulerError> {
        let title = title.into().trim().to_string();
        if title.is_empty() {
            return Err(SchedulerError::ValidationError(
                "일정 제목이 필요합니다".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            date,
            title,
            time: None,
            description: None,
            completed: false,
            created_at: Utc::now(),
        })
    }

    pub fn with_time(mut self, time: Option<NaiveTime>) -> Self {
        self.time = time;
        self
    }

    pub fn with_description(mut self, description: String) -> Self {
        if !description.trim().is_empty() {
            self.description = Some(description);
        }
        self
    }

    /// `HH:MM`、時刻がなければ終日ラベル
    pub fn time_label(&self) -> String {
        format_time(self.time)
    }
}

pub fn format_time(time: Option<NaiveTime>) -> String {
    match time {
        Some(t) => t.format("%H:%M").to_string(),
        None => ALL_DAY_LABEL.to_string(),
    }
}

/// 変更可能なフィールドは完了フラグのみ
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub completed: Option<bool>,
}

/// イベント集合へのアクセス口。インタプリタはこのトレイト越しにのみ操作する
pub trait EventStore: Send {
    fn list(&self) -> Vec<Event>;
    fn add(&mut self, event: Event) -> anyhow::Result<Event>;
    fn remove(&mut self, id: Uuid) -> anyhow::Result<bool>;
    fn update(&mut self, id: Uuid, patch: EventPatch) -> anyhow::Result<bool>;

    fn list_by_date(&self, date: NaiveDate) -> Vec<Event> {
        self.list().into_iter().filter(|e| e.date == date).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub events: Vec<Event>,
}

impl Schedule {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn remove_event(&mut self, event_id: Uuid) -> bool {
        if let Some(pos) = self.events.iter().position(|e| e.id == event_id) {
            self.events.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn get_event(&self, event_id: Uuid) -> Option<&Event> {
        self.events.iter().find(|e| e.id == event_id)
    }

    pub fn get_event_mut(&mut self, event_id: Uuid) -> Option<&mut Event> {
        self.events.iter_mut().find(|e| e.id == event_id)
    }

    pub fn get_events_by_date(&self, date: NaiveDate) -> Vec<&Event> {
        self.events.iter().filter(|e| e.date == date).collect()
    }
}

impl EventStore for Schedule {
    fn list(&self) -> Vec<Event> {
        self.events.clone()
    }

    fn add(&mut self, event: Event) -> anyhow::Result<Event> {
        self.add_event(event.clone());
        Ok(event)
    }

    fn remove(&mut self, id: Uuid) -> anyhow::Result<bool> {
        Ok(self.remove_event(id))
    }

    fn update(&mut self, id: Uuid, patch: EventPatch) -> anyhow::Result<bool> {
        match self.get_event_mut(id) {
            Some(event) => {
                if let Some(completed) = patch.completed {
                    event.completed = completed;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_by_date(&self, date: NaiveDate) -> Vec<Event> {
        self.get_events_by_date(date).into_iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Query,
    Delete,
    Unrecognized,
}

/// 1回の発話を解釈した結果
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedIntent {
    pub action: Action,
    pub date_expression: Option<String>,
    pub title: Option<String>,
    pub time: Option<NaiveTime>,
}

impl ParsedIntent {
    pub fn unrecognized() -> Self {
        Self {
            action: Action::Unrecognized,
            date_expression: None,
            title: None,
            time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    pub fn add_user_message(&mut self, content: String) {
        self.push(MessageRole::User, content);
    }

    pub fn add_assistant_message(&mut self, content: String) {
        self.push(MessageRole::Assistant, content);
    }

    fn push(&mut self, role: MessageRole, content: String) {
        self.messages.push(ChatMessage {
            role,
            content,
            timestamp: Utc::now(),
        });
    }

    /// 新しい順に最大 `count` 件
    pub fn get_recent_messages(&self, count: usize) -> Vec<&ChatMessage> {
        self.messages.iter().rev().take(count).collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("입력 오류: {0}")]
    ValidationError(String),
    #[error("찾을 수 없음: {0}")]
    NotFound(String),
    #[error("해석 오류: {0}")]
    ParseError(String),
    #[error("빈 명령은 처리할 수 없습니다")]
    EmptyUtterance,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// `Option<NaiveTime>` を `"HH:MM"` として読み書きする
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &Option<NaiveTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(t) => serializer.serialize_str(&t.format("%H:%M").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => NaiveTime::parse_from_str(s, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_event_requires_title() {
        assert!(matches!(
            Event::new("   ", date(2025, 3, 10)),
            Err(SchedulerError::ValidationError(_))
        ));

        let event = Event::new("  회의 ", date(2025, 3, 10)).unwrap();
        assert_eq!(event.title, "회의");
        assert!(!event.completed);
        assert_eq!(event.time_label(), ALL_DAY_LABEL);
    }

    #[test]
    fn test_event_serializes_date_and_time() {
        let event = Event::new("회의", date(2025, 3, 11))
            .unwrap()
            .with_time(NaiveTime::from_hms_opt(15, 0, 0));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["date"], "2025-03-11");
        assert_eq!(json["time"], "15:00");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_schedule_update_only_touches_completed() {
        let mut schedule = Schedule::new();
        let event = schedule
            .add(Event::new("보고서", date(2025, 3, 10)).unwrap())
            .unwrap();

        let patched = schedule
            .update(event.id, EventPatch { completed: Some(true) })
            .unwrap();
        assert!(patched);
        assert!(schedule.get_event(event.id).unwrap().completed);
        assert_eq!(schedule.get_event(event.id).unwrap().title, "보고서");

        assert!(!schedule.update(Uuid::new_v4(), EventPatch::default()).unwrap());
        assert!(schedule.remove(event.id).unwrap());
        assert!(!schedule.remove(event.id).unwrap());
    }

    #[test]
    fn test_list_by_date_filters_exactly() {
        let mut schedule = Schedule::new();
        schedule.add_event(Event::new("a", date(2025, 3, 10)).unwrap());
        schedule.add_event(Event::new("b", date(2025, 3, 11)).unwrap());

        let on_tenth = schedule.list_by_date(date(2025, 3, 10));
        assert_eq!(on_tenth.len(), 1);
        assert_eq!(on_tenth[0].title, "a");
    }
}
