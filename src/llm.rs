use crate::config::Config;
use crate::models::{Action, Event, ParsedIntent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::env;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// 解釈時に外部サービスへ渡す文脈
#[derive(Debug, Clone)]
pub struct InterpretContext {
    pub today: NaiveDate,
    pub selected_date: NaiveDate,
    /// 選択中の日付の予定
    pub events: Vec<Event>,
}

#[derive(Debug, Clone)]
pub struct LLMRequest {
    pub user_input: String,
    pub context: InterpretContext,
}

#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub intent: ParsedIntent,
    pub response_text: Option<String>,
}

#[async_trait]
pub trait LLM: Send + Sync {
    async fn interpret(&self, request: LLMRequest) -> Result<LLMResponse>;
    async fn test_connection(&self) -> Result<()>;
}

pub struct LLMClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LLMClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let llm_config = &config.llm;

        // APIキーが無くても生成はでき、呼び出し時にエラーになる
        let api_key = llm_config
            .api_key
            .clone()
            .or_else(|| env::var("GEMINI_API_KEY").ok())
            .or_else(|| env::var("LLM_API_KEY").ok())
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!("LLM APIキーが設定されていません");
        }

        let base_url = llm_config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());

        let model = llm_config
            .model
            .clone()
            .unwrap_or_else(|| "gemini-2.5-flash".to_string());

        let timeout = Duration::from_secs(llm_config.timeout_secs.unwrap_or(5));
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature: llm_config.temperature.unwrap_or(0.2),
            max_tokens: llm_config.max_tokens.unwrap_or(500),
        })
    }
}

#[async_trait]
impl LLM for LLMClient {
    async fn interpret(&self, request: LLMRequest) -> Result<LLMResponse> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            anyhow!("LLM API key not found. Please set llm.api_key in config or GEMINI_API_KEY environment variable")
        })?;

        let system_prompt = create_system_prompt();
        let user_message = create_user_message(&request);
        debug!(%user_message, "LLMへ送信");

        let request_url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        );

        let payload = json!({
            "contents": [
                {
                    "role": "user",
                    "parts": [
                        {
                            "text": format!("{}\n\n{}", system_prompt, user_message)
                        }
                    ]
                }
            ],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_tokens
            }
        });

        let response = self
            .http
            .post(&request_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        debug!(status = %response.status(), "LLMから応答");

        let response_json: Value = response.json().await?;

        let content = response_json["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                warn!(?response_json, "LLMの応答形式が不正");
                anyhow!("Invalid response format from LLM")
            })?;

        parse_llm_response(content)
    }

    async fn test_connection(&self) -> Result<()> {
        let today = chrono::Utc::now().date_naive();
        let test_request = LLMRequest {
            user_input: "안녕".to_string(),
            context: InterpretContext {
                today,
                selected_date: today,
                events: Vec::new(),
            },
        };
        self.interpret(test_request).await.map(|_| ())
    }
}

fn create_system_prompt() -> String {
    r#"
당신은 캘린더 명령 해석기입니다. 사용자의 한국어 문장을 읽고 아래 JSON 하나만 출력하세요.

가능한 action:
- add: 새 일정 추가
- query: 일정 조회
- delete: 일정 삭제
- unrecognized: 그 외

```json
{
    "action": "add | query | delete | unrecognized",
    "date": "날짜 표현 (예: 내일, 다음 주 금요일, 2025-03-14) 또는 null",
    "title": "일정 제목 또는 null",
    "time": "HH:MM 형식의 시각 또는 null (종일이면 null)",
    "message": "사용자에게 보여줄 짧은 응답"
}
```

날짜를 알 수 없으면 date 는 null 로 두세요. 선택된 날짜가 기본값으로 사용됩니다.
"#
    .to_string()
}

fn create_user_message(request: &LLMRequest) -> String {
    let context = &request.context;
    let mut message = format!("사용자 입력: {}", request.user_input);

    message.push_str(&format!(
        "\n\n오늘: {}\n선택된 날짜: {}",
        context.today.format("%Y-%m-%d"),
        context.selected_date.format("%Y-%m-%d")
    ));

    if !context.events.is_empty() {
        message.push_str("\n선택된 날짜의 일정:");
        for event in &context.events {
            message.push_str(&format!("\n- {} ({})", event.title, event.time_label()));
        }
    }

    message
}

/// モデルの生テキストを意図に変換する
pub fn parse_llm_response(content: &str) -> Result<LLMResponse> {
    // ```json ... ``` で囲まれていれば外す
    let mut content = content.trim();
    if let Some(rest) = content.strip_prefix("```json") {
        content = rest.trim_start();
    } else if let Some(rest) = content.strip_prefix("```") {
        content = rest.trim_start();
    }
    if let Some(rest) = content.strip_suffix("```") {
        content = rest.trim_end();
    }

    let response_json: Value =
        serde_json::from_str(content).map_err(|e| anyhow!("Failed to parse LLM response: {}", e))?;

    let action_str = response_json["action"]
        .as_str()
        .ok_or_else(|| anyhow!("Action type is missing in the response"))?;
    let action = parse_action_type(action_str);

    let non_empty = |key: &str| {
        response_json[key]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let time = match non_empty("time") {
        Some(raw) => Some(
            NaiveTime::parse_from_str(&raw, "%H:%M")
                .map_err(|e| anyhow!("Invalid time '{}' in LLM response: {}", raw, e))?,
        ),
        None => None,
    };

    Ok(LLMResponse {
        intent: ParsedIntent {
            action,
            date_expression: non_empty("date"),
            title: non_empty("title"),
            time,
        },
        response_text: non_empty("message"),
    })
}

fn parse_action_type(action_str: &str) -> Action {
    match action_str.trim().to_lowercase().as_str() {
        "add" | "create" | "create_event" => Action::Add,
        "query" | "list" | "list_events" | "search" | "search_events" => Action::Query,
        "delete" | "remove" | "delete_event" => Action::Delete,
        _ => Action::Unrecognized,
    }
}

enum MockReply {
    Content(String),
    Failure(String),
}

/// オフライン・テスト用のモックLLMクライアント。登録順に応答を返す
pub struct MockLLMClient {
    replies: Mutex<VecDeque<MockReply>>,
    delay: Option<Duration>,
}

impl MockLLMClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            delay: None,
        }
    }

    /// モデルが返す生テキストを登録
    pub fn with_reply(self, content: impl Into<String>) -> Self {
        self.push(MockReply::Content(content.into()))
    }

    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(MockReply::Failure(message.into()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, reply: MockReply) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }
}

impl Default for MockLLMClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLM for MockLLMClient {
    async fn interpret(&self, _request: LLMRequest) -> Result<LLMResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .replies
            .lock()
            .map_err(|_| anyhow!("mock reply queue poisoned"))?
            .pop_front();

        match reply {
            Some(MockReply::Content(content)) => parse_llm_response(&content),
            Some(MockReply::Failure(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted reply left")),
        }
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }
}
