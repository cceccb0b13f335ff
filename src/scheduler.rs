use crate::config::{Config, ConfigManager};
use crate::interpreter::{CommandInterpreter, SessionContext};
use crate::llm::{LLMClient, LLM};
use crate::models::{
    ConversationHistory, Event, EventPatch, EventStore, MessageRole, SchedulerError,
};
use crate::resolver::DateTimeResolver;
use crate::storage::{FileEventStore, Storage};
use anyhow::Result;
use chrono::{NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{info, warn};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

/// 解釈器をどこに向けるか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterMode {
    /// キーワード解釈のみ
    Local,
    /// 設定に従う（`llm.enabled` なら外部サービスへ委譲）
    Configured,
}

/// 1セッション分の状態。発話は `&mut self` で1件ずつ処理される
pub struct Scheduler {
    store: Box<dyn EventStore>,
    interpreter: CommandInterpreter,
    conversation_history: ConversationHistory,
    selected_date: NaiveDate,
    timezone: Tz,
    fixed_today: Option<NaiveDate>,
}

impl Scheduler {
    pub fn new(store: Box<dyn EventStore>, interpreter: CommandInterpreter, timezone: Tz) -> Self {
        let selected_date = Utc::now().with_timezone(&timezone).date_naive();
        Self {
            store,
            interpreter,
            conversation_history: ConversationHistory::new(),
            selected_date,
            timezone,
            fixed_today: None,
        }
    }

    pub fn from_config(config: &Config, config_manager: &ConfigManager, mode: InterpreterMode) -> Result<Self> {
        let storage = Storage::new(config_manager.data_directory(config))?;
        let store = FileEventStore::open(storage)?;

        let resolver = DateTimeResolver::new(config.resolver_options());
        let mut interpreter =
            CommandInterpreter::new(resolver).with_default_time(config.default_time()?);

        let delegate: Option<Arc<dyn LLM>> = match mode {
            InterpreterMode::Local => None,
            InterpreterMode::Configured if config.llm.enabled => {
                Some(Arc::new(LLMClient::from_config(config)?))
            }
            InterpreterMode::Configured => None,
        };
        if let Some(delegate) = delegate {
            info!("解釈を外部サービスに委譲します");
            interpreter = interpreter.with_delegate(delegate, config.delegation_timeout());
        }

        Ok(Self::new(Box::new(store), interpreter, config.timezone()?))
    }

    /// 「今日」を固定する（選択日付も合わせる）
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.fixed_today = Some(today);
        self.selected_date = today;
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.fixed_today
            .unwrap_or_else(|| Utc::now().with_timezone(&self.timezone).date_naive())
    }

    pub fn selected_date(&self) -> NaiveDate {
        self.selected_date
    }

    pub fn select_date(&mut self, date: NaiveDate) {
        self.selected_date = date;
    }

    /// `내일` などの表現を今日基準で解決する
    pub fn resolve_date_expression(&self, expression: &str) -> Option<NaiveDate> {
        self.interpreter
            .resolver()
            .resolve_date(expression, self.today())
    }

    pub fn is_delegating(&self) -> bool {
        self.interpreter.is_delegating()
    }

    pub async fn check_delegate(&self) -> Result<()> {
        self.interpreter.check_delegate().await
    }

    /// チャット入力を1件処理する。空入力は履歴にも残さず拒否する
    pub async fn process_user_input(&mut self, user_input: String) -> Result<String> {
        let utterance = user_input.trim();
        if utterance.is_empty() {
            return Err(SchedulerError::EmptyUtterance.into());
        }

        self.conversation_history
            .add_user_message(utterance.to_string());

        let ctx = SessionContext {
            today: self.today(),
            selected_date: self.selected_date,
        };

        let message = match self
            .interpreter
            .handle(utterance, &ctx, self.store.as_mut())
            .await
        {
            Ok(reply) => reply.message,
            Err(e) => {
                warn!(error = %e, "コマンド処理に失敗");
                format!("오류가 발생했습니다: {}", e)
            }
        };

        self.conversation_history
            .add_assistant_message(message.clone());
        Ok(message)
    }

    // === フォームからの操作 ===

    pub fn add_event(
        &mut self,
        title: &str,
        date: Option<NaiveDate>,
        time: Option<NaiveTime>,
        description: Option<String>,
    ) -> Result<Event> {
        let mut event = Event::new(title, date.unwrap_or(self.selected_date))?.with_time(time);
        if let Some(description) = description {
            event = event.with_description(description);
        }
        self.store.add(event)
    }

    pub fn toggle_completed(&mut self, id: Uuid) -> Result<bool> {
        let event = self
            .store
            .list()
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        self.store.update(
            id,
            EventPatch {
                completed: Some(!event.completed),
            },
        )?;
        Ok(!event.completed)
    }

    pub fn delete_event(&mut self, id: Uuid) -> Result<bool> {
        self.store.remove(id)
    }

    /// 終日を先頭にした時刻順
    pub fn events_on(&self, date: NaiveDate) -> Vec<Event> {
        let mut events = self.store.list_by_date(date);
        events.sort_by_key(|e| e.time);
        events
    }

    pub fn all_events(&self) -> Vec<Event> {
        let mut events = self.store.list();
        events.sort_by_key(|e| (e.date, e.time));
        events
    }

    /// ID の前方一致で1件に絞る
    pub fn find_event_id(&self, prefix: &str) -> Result<Uuid, SchedulerError> {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return Err(SchedulerError::ValidationError("ID가 필요합니다".to_string()));
        }

        let matches: Vec<Uuid> = self
            .store
            .list()
            .into_iter()
            .map(|e| e.id)
            .filter(|id| id.to_string().starts_with(&prefix))
            .collect();

        match matches.as_slice() {
            [id] => Ok(*id),
            [] => Err(SchedulerError::NotFound(prefix)),
            _ => Err(SchedulerError::ValidationError(format!(
                "'{}'에 해당하는 일정이 여러 개입니다",
                prefix
            ))),
        }
    }

    /// 既存IDと重複しないイベントだけを取り込む
    pub fn import_events(&mut self, events: Vec<Event>) -> Result<usize> {
        let existing: Vec<Uuid> = self.store.list().into_iter().map(|e| e.id).collect();
        let mut imported = 0;
        for event in events {
            if existing.contains(&event.id) {
                continue;
            }
            self.store.add(event)?;
            imported += 1;
        }
        Ok(imported)
    }

    // === 会話履歴 ===

    pub fn clear_conversation_history(&mut self) {
        self.conversation_history.clear();
    }

    pub fn conversation_history(&self) -> &ConversationHistory {
        &self.conversation_history
    }

    pub fn get_conversation_summary(&self) -> String {
        if self.conversation_history.messages.is_empty() {
            return "대화 기록이 없습니다.".to_string();
        }

        let total_messages = self.conversation_history.messages.len();
        let user_messages = self
            .conversation_history
            .messages
            .iter()
            .filter(|msg| msg.role == MessageRole::User)
            .count();
        let assistant_messages = total_messages - user_messages;

        let recent_messages = self.conversation_history.get_recent_messages(10);

        let mut summary = format!(
            "📊 대화 통계:\n  • 전체 메시지: {}\n  • 사용자: {}\n  • 어시스턴트: {}\n\n",
            total_messages, user_messages, assistant_messages
        );

        summary.push_str(&format!("💬 최근 대화 (최신 {}건):\n", recent_messages.len()));
        for (i, msg) in recent_messages.iter().enumerate() {
            let (role_icon, role_name) = match msg.role {
                MessageRole::User => ("👤", "사용자"),
                MessageRole::Assistant => ("🤖", "어시스턴트"),
            };
            summary.push_str(&format!(
                "  {}. {} {}: {}\n",
                recent_messages.len() - i,
                role_icon,
                role_name,
                truncate(&msg.content, 100)
            ));
        }

        summary
    }

    /// 会話ログをファイルに保存する
    pub fn save_conversation_log_to_file(&self, file_path: Option<&str>) -> Result<String, SchedulerError> {
        let file_path = match file_path {
            Some(path) => path.to_string(),
            None => {
                let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
                format!("conversation_log_{}.txt", timestamp)
            }
        };

        std::fs::write(&file_path, self.get_detailed_conversation_log())?;
        Ok(file_path)
    }

    pub fn get_detailed_conversation_log(&self) -> String {
        if self.conversation_history.messages.is_empty() {
            return "대화 기록이 없습니다.".to_string();
        }

        let mut log = String::new();
        log.push_str("=== 캘린더 어시스턴트 대화 로그 ===\n");
        log.push_str(&format!(
            "작성 시각: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ));
        log.push_str(&format!(
            "전체 메시지: {}\n\n",
            self.conversation_history.messages.len()
        ));

        for (i, msg) in self.conversation_history.messages.iter().enumerate() {
            let role_name = match msg.role {
                MessageRole::User => "사용자",
                MessageRole::Assistant => "어시스턴트",
            };
            log.push_str(&format!(
                "[{}] {} {}: {}\n\n",
                i + 1,
                msg.timestamp.format("%H:%M:%S"),
                role_name,
                msg.content
            ));
        }

        log.push_str("=== 로그 끝 ===");
        log
    }
}

/// 書記素単位で切り詰める（韓国語をバイト境界で切らない）
fn truncate(text: &str, max: usize) -> String {
    let graphemes: Vec<&str> = text.graphemes(true).collect();
    if graphemes.len() > max {
        format!("{}...", graphemes[..max.saturating_sub(3)].concat())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Schedule;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn scheduler() -> Scheduler {
        let interpreter = CommandInterpreter::new(DateTimeResolver::default());
        Scheduler::new(Box::new(Schedule::new()), interpreter, chrono_tz::Asia::Seoul)
            .with_today(date(2025, 3, 10))
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected_without_history() {
        let mut scheduler = scheduler();
        let result = scheduler.process_user_input("   ".to_string()).await;

        assert!(result.is_err());
        assert!(scheduler.conversation_history().messages.is_empty());
    }

    #[tokio::test]
    async fn test_chat_records_both_sides() -> Result<()> {
        let mut scheduler = scheduler();
        let reply = scheduler
            .process_user_input("내일 오후 3시에 회의 추가해줘".to_string())
            .await?;

        assert!(reply.contains("2025-03-11"));
        let messages = &scheduler.conversation_history().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].content, reply);
        assert_eq!(scheduler.events_on(date(2025, 3, 11)).len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_selected_date_is_the_fallback() -> Result<()> {
        let mut scheduler = scheduler();
        scheduler.select_date(date(2025, 3, 20));
        scheduler.process_user_input("회의 추가".to_string()).await?;

        assert_eq!(scheduler.events_on(date(2025, 3, 20)).len(), 1);
        Ok(())
    }

    #[test]
    fn test_form_operations() -> Result<()> {
        let mut scheduler = scheduler();
        let event = scheduler.add_event(
            "운동",
            None,
            NaiveTime::from_hms_opt(7, 0, 0),
            Some("헬스장".to_string()),
        )?;
        assert_eq!(event.date, date(2025, 3, 10));
        assert_eq!(event.description.as_deref(), Some("헬스장"));

        assert!(scheduler.toggle_completed(event.id)?);
        assert!(scheduler.events_on(date(2025, 3, 10))[0].completed);
        assert!(!scheduler.toggle_completed(event.id)?);

        let prefix = &event.id.to_string()[..8];
        assert_eq!(scheduler.find_event_id(prefix)?, event.id);
        assert!(matches!(
            scheduler.find_event_id("zzzz"),
            Err(SchedulerError::NotFound(_))
        ));

        assert!(scheduler.delete_event(event.id)?);
        assert!(scheduler.toggle_completed(event.id).is_err());
        assert!(scheduler.add_event("  ", None, None, None).is_err());
        Ok(())
    }

    #[test]
    fn test_import_skips_known_ids() -> Result<()> {
        let mut scheduler = scheduler();
        let existing = scheduler.add_event("회의", None, None, None)?;
        let fresh = Event::new("출장", date(2025, 4, 1))?;

        let imported = scheduler.import_events(vec![existing, fresh])?;
        assert_eq!(imported, 1);
        assert_eq!(scheduler.all_events().len(), 2);
        Ok(())
    }

    #[test]
    fn test_resolve_date_expression_uses_today() {
        let scheduler = scheduler();
        assert_eq!(scheduler.resolve_date_expression("모레"), Some(date(2025, 3, 12)));
        assert_eq!(scheduler.resolve_date_expression("언젠가"), None);
    }

    #[test]
    fn test_truncate_respects_graphemes() {
        let long = "가".repeat(120);
        let cut = truncate(&long, 100);
        assert_eq!(cut.graphemes(true).count(), 100);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate("짧은 말", 100), "짧은 말");
    }

    #[tokio::test]
    async fn test_summary_and_log() -> Result<()> {
        let mut scheduler = scheduler();
        assert_eq!(scheduler.get_conversation_summary(), "대화 기록이 없습니다.");

        scheduler.process_user_input("안녕".to_string()).await?;
        let summary = scheduler.get_conversation_summary();
        assert!(summary.contains("전체 메시지: 2"));

        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("log.txt");
        let saved = scheduler.save_conversation_log_to_file(path.to_str())?;
        let content = std::fs::read_to_string(saved)?;
        assert!(content.contains("안녕"));

        scheduler.clear_conversation_history();
        assert!(scheduler.conversation_history().messages.is_empty());
        Ok(())
    }
}
