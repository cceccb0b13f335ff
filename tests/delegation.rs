use anyhow::Result;
use calendar_chat_agent::config::{Config, ConfigManager};
use calendar_chat_agent::interpreter::{CommandInterpreter, SessionContext, FALLBACK_MESSAGE};
use calendar_chat_agent::llm::MockLLMClient;
use calendar_chat_agent::models::{Action, EventStore, Schedule};
use calendar_chat_agent::resolver::DateTimeResolver;
use calendar_chat_agent::scheduler::{InterpreterMode, Scheduler};
use calendar_chat_agent::storage::Storage;
use chrono::{NaiveDate, NaiveTime};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
}

fn ctx() -> SessionContext {
    SessionContext {
        today: today(),
        selected_date: today(),
    }
}

fn delegating(mock: MockLLMClient, timeout: Duration) -> CommandInterpreter {
    CommandInterpreter::new(DateTimeResolver::default()).with_delegate(Arc::new(mock), timeout)
}

const ADD_REPLY: &str = r#"{"action": "add", "date": "내일", "title": "회의", "time": "15:00", "message": "회의를 추가할게요"}"#;

#[tokio::test]
async fn test_delegated_intent_is_applied_locally() -> Result<()> {
    let interpreter = delegating(MockLLMClient::new().with_reply(ADD_REPLY), Duration::from_secs(5));
    let mut store = Schedule::new();

    let reply = interpreter.handle("내일 3시 회의", &ctx(), &mut store).await?;

    assert_eq!(reply.intent.action, Action::Add);
    let events = store.list();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].date, NaiveDate::from_ymd_opt(2025, 3, 11).unwrap());
    assert_eq!(events[0].time, NaiveTime::from_hms_opt(15, 0, 0));
    assert_eq!(reply.message, "'회의' 일정을 추가했습니다 (2025-03-11, 15:00)");
    Ok(())
}

#[tokio::test]
async fn test_delegated_unrecognized_uses_service_message() -> Result<()> {
    let mock = MockLLMClient::new()
        .with_reply(r#"{"action": "unrecognized", "message": "안녕하세요! 일정을 말씀해 주세요."}"#);
    let interpreter = delegating(mock, Duration::from_secs(5));
    let mut store = Schedule::new();

    let reply = interpreter.handle("안녕", &ctx(), &mut store).await?;
    assert_eq!(reply.message, "안녕하세요! 일정을 말씀해 주세요.");
    assert!(store.list().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failures_become_fallback_message() -> Result<()> {
    let cases = [
        MockLLMClient::new().with_reply("sure, I'll add a meeting"),
        MockLLMClient::new().with_reply(r#"{"title": "회의"}"#),
        MockLLMClient::new().with_failure("connection refused"),
        MockLLMClient::new(),
    ];

    for mock in cases {
        let interpreter = delegating(mock, Duration::from_secs(5));
        let mut store = Schedule::new();

        let reply = interpreter
            .handle("내일 오후 3시에 회의 추가해줘", &ctx(), &mut store)
            .await?;

        assert_eq!(reply.message, FALLBACK_MESSAGE);
        assert_eq!(reply.intent.action, Action::Unrecognized);
        assert!(store.list().is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_slow_service_times_out() -> Result<()> {
    let mock = MockLLMClient::new()
        .with_reply(ADD_REPLY)
        .with_delay(Duration::from_millis(500));
    let interpreter = delegating(mock, Duration::from_millis(50));
    let mut store = Schedule::new();

    let reply = interpreter.handle("내일 회의 추가", &ctx(), &mut store).await?;

    assert_eq!(reply.message, FALLBACK_MESSAGE);
    assert!(store.list().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_delegated_handling_runs_on_spawned_task() -> Result<()> {
    let interpreter = delegating(MockLLMClient::new().with_reply(ADD_REPLY), Duration::from_secs(5));

    let task = tokio::spawn(async move {
        let mut store = Schedule::new();
        let reply = interpreter.handle("내일 3시 회의", &ctx(), &mut store).await?;
        Ok::<_, anyhow::Error>((reply, store.list()))
    });
    let (reply, events) = task.await??;

    assert_eq!(reply.intent.action, Action::Add);
    assert_eq!(events.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_delegating_scheduler_runs_on_spawned_task() -> Result<()> {
    let interpreter = delegating(MockLLMClient::new().with_reply(ADD_REPLY), Duration::from_secs(5));
    let mut scheduler = Scheduler::new(Box::new(Schedule::new()), interpreter, chrono_tz::Asia::Seoul)
        .with_today(today());

    let task = tokio::spawn(async move {
        let response = scheduler
            .process_user_input("내일 3시 회의".to_string())
            .await?;
        Ok::<_, anyhow::Error>((response, scheduler))
    });
    let (response, scheduler) = task.await??;

    assert_eq!(response, "'회의' 일정을 추가했습니다 (2025-03-11, 15:00)");
    assert_eq!(scheduler.events_on(NaiveDate::from_ymd_opt(2025, 3, 11).unwrap()).len(), 1);
    Ok(())
}

fn candidate_body(text: &str) -> serde_json::Value {
    json!({
        "candidates": [{
            "content": {
                "parts": [{ "text": text }]
            }
        }]
    })
}

fn delegating_config(server: &MockServer, data_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.llm.enabled = true;
    config.llm.api_key = Some("test-key".to_string());
    config.llm.base_url = Some(server.uri());
    config.llm.model = Some("test-model".to_string());
    config.app.data_dir = Some(data_dir.path().to_string_lossy().to_string());
    config
}

#[tokio::test]
async fn test_end_to_end_delegated_add_is_persisted() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/test-model:generateContent"))
        .and(query_param("key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(candidate_body(ADD_REPLY)))
        .expect(1)
        .mount(&server)
        .await;

    let config_dir = TempDir::new()?;
    let data_dir = TempDir::new()?;
    let config = delegating_config(&server, &data_dir);
    let manager = ConfigManager::with_dir(config_dir.path())?;

    let mut scheduler =
        Scheduler::from_config(&config, &manager, InterpreterMode::Configured)?.with_today(today());
    assert!(scheduler.is_delegating());

    let response = scheduler
        .process_user_input("내일 오후 3시에 회의 추가해줘".to_string())
        .await?;
    assert_eq!(response, "'회의' 일정을 추가했습니다 (2025-03-11, 15:00)");

    let saved = Storage::new(data_dir.path())?.load_schedule()?;
    assert_eq!(saved.events.len(), 1);
    assert_eq!(saved.events[0].title, "회의");
    Ok(())
}

#[tokio::test]
async fn test_end_to_end_server_error_falls_back() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/test-model:generateContent"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config_dir = TempDir::new()?;
    let data_dir = TempDir::new()?;
    let config = delegating_config(&server, &data_dir);
    let manager = ConfigManager::with_dir(config_dir.path())?;

    let mut scheduler =
        Scheduler::from_config(&config, &manager, InterpreterMode::Configured)?.with_today(today());
    let response = scheduler
        .process_user_input("내일 회의 추가해줘".to_string())
        .await?;

    assert_eq!(response, FALLBACK_MESSAGE);
    assert!(scheduler.all_events().is_empty());
    assert_eq!(scheduler.conversation_history().messages.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_offline_mode_ignores_configured_service() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let config_dir = TempDir::new()?;
    let data_dir = TempDir::new()?;
    let config = delegating_config(&server, &data_dir);
    let manager = ConfigManager::with_dir(config_dir.path())?;

    let mut scheduler =
        Scheduler::from_config(&config, &manager, InterpreterMode::Local)?.with_today(today());
    assert!(!scheduler.is_delegating());

    scheduler
        .process_user_input("내일 오후 3시에 회의 추가해줘".to_string())
        .await?;
    assert_eq!(scheduler.all_events().len(), 1);
    Ok(())
}
