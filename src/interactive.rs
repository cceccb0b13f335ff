use crate::models::{Event, SchedulerError};
use crate::scheduler::Scheduler;
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use colored::Colorize;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// コマンド実行結果
#[derive(Debug, PartialEq, Eq)]
pub enum CommandResult {
    Continue,
    Exit,
    ShowHelp,
}

/// 対話モードのコマンドハンドラー
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult>;
    fn help(&self) -> &str;
    fn aliases(&self) -> Vec<&str> {
        vec![]
    }
}

/// 1件分の表示（番号・完了マーク・時刻・ID先頭）
pub fn format_event_line(index: usize, event: &Event) -> String {
    let mark = if event.completed { "✓" } else { " " };
    let id = event.id.to_string();
    format!(
        "{}. [{}] {} {} ({})",
        index,
        mark,
        event.time_label(),
        event.title,
        &id[..8]
    )
}

/// `YYYY-MM-DD` を優先し、だめなら日付表現として解決する
pub fn parse_date_input(scheduler: &Scheduler, input: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| scheduler.resolve_date_expression(input))
}

pub fn print_events(date: NaiveDate, events: &[Event]) {
    println!("{}", format!("📅 {}", date).bold().blue());
    if events.is_empty() {
        println!("  {}", "일정이 없습니다".yellow());
        return;
    }
    for (i, event) in events.iter().enumerate() {
        let line = format_event_line(i + 1, event);
        if event.completed {
            println!("  {}", line.dimmed());
        } else {
            println!("  {}", line);
        }
        if let Some(description) = &event.description {
            println!("     {}", description.dimmed());
        }
    }
}

pub struct HistoryCommand;

#[async_trait]
impl CommandHandler for HistoryCommand {
    async fn execute(&self, _args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult> {
        println!("{}", scheduler.get_conversation_summary());
        Ok(CommandResult::Continue)
    }

    fn help(&self) -> &str {
        "대화 기록을 표시합니다"
    }

    fn aliases(&self) -> Vec<&str> {
        vec!["hist"]
    }
}

pub struct SaveCommand;

#[async_trait]
impl CommandHandler for SaveCommand {
    async fn execute(&self, args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult> {
        match scheduler.save_conversation_log_to_file(args.get(1).copied()) {
            Ok(saved_path) => println!("💾 대화 로그를 저장했습니다: {}", saved_path.green()),
            Err(e) => eprintln!("❌ {}", e.to_string().red()),
        }
        Ok(CommandResult::Continue)
    }

    fn help(&self) -> &str {
        "대화 로그를 파일로 저장합니다. 사용법: save [파일명]"
    }
}

pub struct ClearCommand;

#[async_trait]
impl CommandHandler for ClearCommand {
    async fn execute(&self, _args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult> {
        scheduler.clear_conversation_history();
        println!("🗑️ 대화 기록을 지웠습니다");
        Ok(CommandResult::Continue)
    }

    fn help(&self) -> &str {
        "대화 기록을 지웁니다"
    }

    fn aliases(&self) -> Vec<&str> {
        vec!["reset"]
    }
}

/// 選択日付の変更。`YYYY-MM-DD` か `내일` などの表現を受け付ける
pub struct DateCommand;

#[async_trait]
impl CommandHandler for DateCommand {
    async fn execute(&self, args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult> {
        let expression = args[1..].join(" ");
        if expression.is_empty() {
            println!("선택된 날짜: {}", scheduler.selected_date().to_string().cyan());
            return Ok(CommandResult::Continue);
        }

        match parse_date_input(scheduler, &expression) {
            Some(date) => {
                scheduler.select_date(date);
                println!("📅 날짜를 {}(으)로 변경했습니다", date.to_string().cyan());
            }
            None => eprintln!("❌ {}", format!("날짜를 해석할 수 없습니다: {}", expression).red()),
        }
        Ok(CommandResult::Continue)
    }

    fn help(&self) -> &str {
        "선택 날짜를 바꿉니다. 사용법: date <YYYY-MM-DD|내일|금요일 ...>"
    }
}

pub struct ListCommand;

#[async_trait]
impl CommandHandler for ListCommand {
    async fn execute(&self, _args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult> {
        let date = scheduler.selected_date();
        print_events(date, &scheduler.events_on(date));
        Ok(CommandResult::Continue)
    }

    fn help(&self) -> &str {
        "선택 날짜의 일정을 표시합니다"
    }

    fn aliases(&self) -> Vec<&str> {
        vec!["ls"]
    }
}

pub struct DoneCommand;

#[async_trait]
impl CommandHandler for DoneCommand {
    async fn execute(&self, args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult> {
        let prefix = args.get(1).copied().unwrap_or_default();
        let result = scheduler
            .find_event_id(prefix)
            .map_err(anyhow::Error::from)
            .and_then(|id| scheduler.toggle_completed(id));
        match result {
            Ok(true) => println!("✅ 완료로 표시했습니다"),
            Ok(false) => println!("↩️ 미완료로 되돌렸습니다"),
            Err(e) => eprintln!("❌ {}", e.to_string().red()),
        }
        Ok(CommandResult::Continue)
    }

    fn help(&self) -> &str {
        "완료 여부를 전환합니다. 사용법: done <ID 앞부분>"
    }
}

pub struct RemoveCommand;

#[async_trait]
impl CommandHandler for RemoveCommand {
    async fn execute(&self, args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult> {
        let prefix = args.get(1).copied().unwrap_or_default();
        let result = scheduler
            .find_event_id(prefix)
            .map_err(anyhow::Error::from)
            .and_then(|id| scheduler.delete_event(id));
        match result {
            Ok(true) => println!("🗑️ 일정을 삭제했습니다"),
            Ok(false) => eprintln!("❌ {}", SchedulerError::NotFound(prefix.to_string()).to_string().red()),
            Err(e) => eprintln!("❌ {}", e.to_string().red()),
        }
        Ok(CommandResult::Continue)
    }

    fn help(&self) -> &str {
        "일정을 삭제합니다. 사용법: rm <ID 앞부분>"
    }

    fn aliases(&self) -> Vec<&str> {
        vec!["del"]
    }
}

pub struct ExitCommand;

#[async_trait]
impl CommandHandler for ExitCommand {
    async fn execute(&self, _args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult> {
        println!("\n{}", scheduler.get_conversation_summary());
        println!("\n👋 안녕히 가세요!");
        Ok(CommandResult::Exit)
    }

    fn help(&self) -> &str {
        "종료합니다"
    }

    fn aliases(&self) -> Vec<&str> {
        vec!["quit", "q"]
    }
}

pub struct HelpCommand;

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn execute(&self, _args: Vec<&str>, _scheduler: &mut Scheduler) -> Result<CommandResult> {
        Ok(CommandResult::ShowHelp)
    }

    fn help(&self) -> &str {
        "이 도움말을 표시합니다"
    }

    fn aliases(&self) -> Vec<&str> {
        vec!["?"]
    }
}

/// それ以外の入力は解釈器へ渡す
pub struct ChatCommand;

#[async_trait]
impl CommandHandler for ChatCommand {
    async fn execute(&self, args: Vec<&str>, scheduler: &mut Scheduler) -> Result<CommandResult> {
        match scheduler.process_user_input(args.join(" ")).await {
            Ok(response) => println!("🤖 {}", response),
            Err(e) => eprintln!("❌ {}", e.to_string().red()),
        }
        Ok(CommandResult::Continue)
    }

    fn help(&self) -> &str {
        "자연어로 일정을 추가·조회·삭제합니다 (예: 내일 오후 3시에 회의 추가해줘)"
    }
}

pub struct InteractiveMode {
    commands: HashMap<String, Arc<dyn CommandHandler>>,
    default_handler: Arc<dyn CommandHandler>,
}

impl InteractiveMode {
    pub fn new() -> Self {
        let mut mode = Self {
            commands: HashMap::new(),
            default_handler: Arc::new(ChatCommand),
        };

        mode.register_command("history", Arc::new(HistoryCommand));
        mode.register_command("save", Arc::new(SaveCommand));
        mode.register_command("clear", Arc::new(ClearCommand));
        mode.register_command("date", Arc::new(DateCommand));
        mode.register_command("list", Arc::new(ListCommand));
        mode.register_command("done", Arc::new(DoneCommand));
        mode.register_command("rm", Arc::new(RemoveCommand));
        mode.register_command("exit", Arc::new(ExitCommand));
        mode.register_command("help", Arc::new(HelpCommand));
        mode
    }

    /// 名前とエイリアスでハンドラーを登録する
    pub fn register_command(&mut self, name: &str, handler: Arc<dyn CommandHandler>) {
        for alias in handler.aliases() {
            self.commands.insert(alias.to_string(), handler.clone());
        }
        self.commands.insert(name.to_string(), handler);
    }

    /// 先頭語が登録コマンドならそれを、なければ解釈器を呼ぶ
    pub async fn dispatch(&self, input: &str, scheduler: &mut Scheduler) -> Result<CommandResult> {
        let args: Vec<&str> = input.split_whitespace().collect();
        let Some(first) = args.first() else {
            return Ok(CommandResult::Continue);
        };

        match self.commands.get(&first.to_lowercase()) {
            Some(handler) => handler.execute(args, scheduler).await,
            None => self.default_handler.execute(args, scheduler).await,
        }
    }

    pub fn show_welcome(&self, scheduler: &Scheduler) {
        println!("{}", "🗓️  캘린더 어시스턴트에 오신 것을 환영합니다!".bold().cyan());
        println!("오늘: {}", scheduler.today().to_string().cyan());
        if scheduler.is_delegating() {
            println!("{}", "외부 언어 모델로 명령을 해석합니다".dimmed());
        }
        println!();
        self.show_help();
        println!();
    }

    pub fn show_help(&self) {
        println!("{}", "📋 사용 가능한 명령:".bold().blue());

        let mut unique_commands: Vec<_> = self
            .commands
            .iter()
            .filter(|(name, handler)| !handler.aliases().contains(&name.as_str()))
            .collect();
        unique_commands.sort_by_key(|(name, _)| name.as_str());

        for (name, handler) in unique_commands {
            let aliases = handler.aliases();
            let alias_text = if aliases.is_empty() {
                String::new()
            } else {
                format!(" ({})", aliases.join(", "))
            };
            println!("  • '{}'{} - {}", name.green(), alias_text.dimmed(), handler.help());
        }
        println!("  • {} - {}", "그 밖의 문장".green(), self.default_handler.help());
    }

    pub async fn run(&self, scheduler: &mut Scheduler) -> Result<()> {
        self.show_welcome(scheduler);

        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();

        loop {
            print!("{} ", format!("[{}] 💬", scheduler.selected_date()).bold().cyan());
            io::stdout().flush()?;

            let input = match lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    // EOF
                    println!("\n👋 세션을 종료합니다.");
                    break;
                }
            };

            let input = input.trim();
            if input.is_empty() {
                continue;
            }

            match self.dispatch(input, scheduler).await? {
                CommandResult::Continue => println!(),
                CommandResult::Exit => break,
                CommandResult::ShowHelp => {
                    self.show_help();
                    println!();
                }
            }
        }

        Ok(())
    }
}

impl Default for InteractiveMode {
    fn default() -> Self {
        Self::new()
    }
}
