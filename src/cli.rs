use anyhow::{anyhow, Result};
use calendar_chat_agent::config::{Config, ConfigManager};
use calendar_chat_agent::interactive::{parse_date_input, print_events, InteractiveMode};
use calendar_chat_agent::models::SchedulerError;
use calendar_chat_agent::scheduler::{InterpreterMode, Scheduler};
use calendar_chat_agent::storage::Storage;
use chrono::{NaiveDate, NaiveTime};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use dialoguer::Confirm;
use std::path::Path;
use tracing::warn;

pub struct Cli {
    pub command: Option<String>,
    pub offline: bool,
    pub verbose: bool,
    pub today: Option<String>,
    pub matches: ArgMatches<'static>,
}

fn id_arg() -> Arg<'static, 'static> {
    Arg::with_name("id")
        .help("Event ID (a unique prefix is enough)")
        .required(true)
        .index(1)
}

pub fn build_app() -> App<'static, 'static> {
    App::new("calendar-chat")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Chat-driven personal calendar")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("offline")
                .long("offline")
                .help("Interpret commands locally even when an LLM is configured")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .help("Enable debug logging")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("today")
                .long("today")
                .help("Override today's date (YYYY-MM-DD)")
                .takes_value(true),
        )
        .subcommand(SubCommand::with_name("interactive").about("Start the chat session (default)"))
        .subcommand(
            SubCommand::with_name("say")
                .about("Run a single chat command and exit")
                .arg(
                    Arg::with_name("utterance")
                        .help("Command text, e.g. \"내일 오후 3시에 회의 추가해줘\"")
                        .required(true)
                        .multiple(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("add")
                .about("Add an event")
                .arg(
                    Arg::with_name("title")
                        .help("Event title")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("date")
                        .long("date")
                        .help("Date (YYYY-MM-DD or an expression such as 내일)")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("time")
                        .long("time")
                        .help("Time (HH:MM); omitted means all-day")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("description")
                        .long("description")
                        .help("Event description")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("list").about("List events for a date").arg(
                Arg::with_name("date")
                    .long("date")
                    .help("Date (YYYY-MM-DD or an expression); defaults to today")
                    .takes_value(true),
            ),
        )
        .subcommand(
            SubCommand::with_name("toggle")
                .about("Toggle the completed flag of an event")
                .arg(id_arg()),
        )
        .subcommand(
            SubCommand::with_name("remove")
                .about("Remove an event")
                .arg(id_arg())
                .arg(
                    Arg::with_name("yes")
                        .long("yes")
                        .short("y")
                        .help("Skip the confirmation prompt")
                        .takes_value(false),
                ),
        )
        .subcommand(SubCommand::with_name("backup").about("Back up the schedule file"))
        .subcommand(
            SubCommand::with_name("export").about("Export the schedule").arg(
                Arg::with_name("path")
                    .help("Export file path")
                    .required(true)
                    .index(1),
            ),
        )
        .subcommand(
            SubCommand::with_name("import")
                .about("Import events from an exported file")
                .arg(
                    Arg::with_name("path")
                        .help("Import file path")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("config")
                .about("Configuration management")
                .subcommand(SubCommand::with_name("init").about("Write default configuration files"))
                .subcommand(SubCommand::with_name("show").about("Show current configuration"))
                .subcommand(SubCommand::with_name("path").about("Show configuration file path")),
        )
}

impl Cli {
    pub fn parse() -> Self {
        Self::from_matches(build_app().get_matches())
    }

    pub fn from_matches(matches: ArgMatches<'static>) -> Self {
        Self {
            command: matches.subcommand_name().map(|s| s.to_string()),
            offline: matches.is_present("offline"),
            verbose: matches.is_present("verbose"),
            today: matches.value_of("today").map(|s| s.to_string()),
            matches,
        }
    }
}

pub struct CliApp {
    config: Config,
    config_manager: ConfigManager,
    mode: InterpreterMode,
    today: Option<NaiveDate>,
}

impl CliApp {
    pub fn new(cli: &Cli, config_manager: ConfigManager, config: Config) -> Result<Self> {
        let today = cli
            .today
            .as_deref()
            .map(|raw| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|_| SchedulerError::ParseError(format!("--today: {}", raw)))
            })
            .transpose()?;

        let mode = if cli.offline {
            InterpreterMode::Local
        } else {
            InterpreterMode::Configured
        };

        Ok(Self {
            config,
            config_manager,
            mode,
            today,
        })
    }

    fn print_success(&self, message: &str) {
        println!("{}", message.green());
    }

    fn print_error(&self, prefix: &str, error: &dyn std::fmt::Display) {
        eprintln!("{}: {}", prefix.red(), error);
    }

    fn scheduler(&self) -> Result<Scheduler> {
        let scheduler = Scheduler::from_config(&self.config, &self.config_manager, self.mode)?;
        Ok(match self.today {
            Some(today) => scheduler.with_today(today),
            None => scheduler,
        })
    }

    fn storage(&self) -> Result<Storage> {
        Storage::new(self.config_manager.data_directory(&self.config))
    }

    pub async fn run(&self, cli: &Cli) -> Result<()> {
        let sub = |name: &str| {
            cli.matches
                .subcommand_matches(name)
                .ok_or_else(|| anyhow!("Invalid {} command", name))
        };

        match cli.command.as_deref() {
            None | Some("interactive") => {
                let mut scheduler = self.scheduler()?;
                if let Err(e) = scheduler.check_delegate().await {
                    warn!(error = %e, "解釈サービスに接続できません");
                    println!(
                        "{}",
                        "⚠️  외부 언어 모델에 연결할 수 없습니다. 실패한 명령은 다시 시도해 주세요.".yellow()
                    );
                }
                InteractiveMode::new().run(&mut scheduler).await
            }
            Some("say") => {
                let words: Vec<&str> = sub("say")?.values_of("utterance").into_iter().flatten().collect();
                self.say_command(words.join(" ")).await
            }
            Some("add") => {
                let matches = sub("add")?;
                self.add_command(
                    matches.value_of("title").unwrap_or_default(),
                    matches.value_of("date"),
                    matches.value_of("time"),
                    matches.value_of("description"),
                )
            }
            Some("list") => self.list_command(sub("list")?.value_of("date")),
            Some("toggle") => self.toggle_command(sub("toggle")?.value_of("id").unwrap_or_default()),
            Some("remove") => {
                let matches = sub("remove")?;
                self.remove_command(matches.value_of("id").unwrap_or_default(), matches.is_present("yes"))
            }
            Some("backup") => self.backup_command(),
            Some("export") => self.export_command(sub("export")?.value_of("path").unwrap_or_default()),
            Some("import") => self.import_command(sub("import")?.value_of("path").unwrap_or_default()),
            Some("config") => match sub("config")?.subcommand_name() {
                Some("init") => self.config_init_command(),
                Some("path") => self.config_path_command(),
                _ => self.config_show_command(),
            },
            Some(other) => Err(anyhow!("Unknown command: {}", other)),
        }
    }

    async fn say_command(&self, utterance: String) -> Result<()> {
        let mut scheduler = self.scheduler()?;
        let response = scheduler.process_user_input(utterance).await?;
        println!("{}", response);
        Ok(())
    }

    fn add_command(
        &self,
        title: &str,
        date: Option<&str>,
        time: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        let mut scheduler = self.scheduler()?;
        let date = date.map(|raw| resolve_date_arg(&scheduler, raw)).transpose()?;
        let time = time
            .map(|raw| {
                NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                    .map_err(|_| SchedulerError::ParseError(format!("시간 형식이 잘못되었습니다: {}", raw)))
            })
            .transpose()?;

        let event = scheduler.add_event(title, date, time, description.map(|s| s.to_string()))?;
        self.print_success(&format!(
            "'{}' 일정을 추가했습니다 ({}, {})",
            event.title,
            event.date,
            event.time_label()
        ));
        println!("ID: {}", event.id.to_string().dimmed());
        Ok(())
    }

    fn list_command(&self, date: Option<&str>) -> Result<()> {
        let scheduler = self.scheduler()?;
        let date = match date {
            Some(raw) => resolve_date_arg(&scheduler, raw)?,
            None => scheduler.today(),
        };
        print_events(date, &scheduler.events_on(date));
        Ok(())
    }

    fn toggle_command(&self, prefix: &str) -> Result<()> {
        let mut scheduler = self.scheduler()?;
        let id = scheduler.find_event_id(prefix)?;
        if scheduler.toggle_completed(id)? {
            self.print_success("완료로 표시했습니다");
        } else {
            println!("{}", "미완료로 되돌렸습니다".yellow());
        }
        Ok(())
    }

    fn remove_command(&self, prefix: &str, skip_confirm: bool) -> Result<()> {
        let mut scheduler = self.scheduler()?;
        let id = scheduler.find_event_id(prefix)?;
        let event = scheduler
            .all_events()
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| SchedulerError::NotFound(prefix.to_string()))?;

        if !skip_confirm {
            let confirm = Confirm::new()
                .with_prompt(format!("'{}' ({}) 일정을 삭제할까요?", event.title, event.date))
                .interact()?;
            if !confirm {
                println!("{}", "삭제를 취소했습니다".yellow());
                return Ok(());
            }
        }

        scheduler.delete_event(id)?;
        self.print_success("일정을 삭제했습니다");
        Ok(())
    }

    fn backup_command(&self) -> Result<()> {
        match self.storage()?.backup_schedule() {
            Ok(backup_path) => {
                self.print_success("백업을 만들었습니다");
                println!("파일: {}", backup_path.display().to_string().cyan());
            }
            Err(e) => self.print_error("백업 오류", &e),
        }
        Ok(())
    }

    fn export_command(&self, path: &str) -> Result<()> {
        match self.storage()?.export_schedule(Path::new(path)) {
            Ok(()) => {
                self.print_success("일정을 내보냈습니다");
                println!("파일: {}", path.cyan());
            }
            Err(e) => self.print_error("내보내기 오류", &e),
        }
        Ok(())
    }

    fn import_command(&self, path: &str) -> Result<()> {
        let schedule = match self.storage()?.import_schedule(Path::new(path)) {
            Ok(schedule) => schedule,
            Err(e) => {
                self.print_error("가져오기 오류", &e);
                return Ok(());
            }
        };

        let mut scheduler = self.scheduler()?;
        let total = schedule.events.len();
        let imported = scheduler.import_events(schedule.events)?;
        self.print_success(&format!("{}개 중 {}개 일정을 가져왔습니다", total, imported));
        Ok(())
    }

    fn config_init_command(&self) -> Result<()> {
        let config_file = self.config_manager.get_config_file_path();
        if config_file.exists() {
            let confirm = Confirm::new()
                .with_prompt("설정 파일이 이미 있습니다. 기본값으로 덮어쓸까요?")
                .interact()?;
            if !confirm {
                println!("{}", "설정 초기화를 취소했습니다".yellow());
                return Ok(());
            }
        }

        self.config_manager.save_config(&Config::default())?;
        let sample = self.config_manager.create_sample_config()?;
        self.print_success("설정 파일을 만들었습니다:");
        println!("  {}", config_file.display().to_string().cyan());
        println!("  {}", sample.display().to_string().cyan());
        println!("{}", "외부 언어 모델을 쓰려면 [llm] 항목에 API 키를 설정하세요".yellow());
        Ok(())
    }

    fn config_show_command(&self) -> Result<()> {
        let config = &self.config;
        println!("{}", "=== 현재 설정 ===".bold().blue());

        println!("{}", "[llm]".bold());
        println!(
            "  enabled: {}",
            if config.llm.enabled { "true".green() } else { "false".yellow() }
        );
        if let Some(model) = &config.llm.model {
            println!("  model: {}", model.cyan());
        }
        if let Some(base_url) = &config.llm.base_url {
            println!("  base_url: {}", base_url.cyan());
        }
        println!("  timeout: {}s", config.delegation_timeout().as_secs().to_string().cyan());
        // キーの値は表示しない
        println!(
            "  api_key: {}",
            if config.llm.api_key.is_some() { "설정됨".green() } else { "없음".red() }
        );

        println!("{}", "[app]".bold());
        println!(
            "  data_dir: {}",
            self.config_manager.data_directory(config).display().to_string().cyan()
        );
        println!("  timezone: {}", config.timezone()?.to_string().cyan());

        println!("{}", "[resolver]".bold());
        println!(
            "  roll_month_day_to_next_year: {}",
            config.resolver.roll_month_day_to_next_year.to_string().cyan()
        );
        println!(
            "  implicit_afternoon_until: {}",
            config
                .resolver
                .implicit_afternoon_until
                .map(|h| h.to_string())
                .unwrap_or_else(|| "-".to_string())
                .cyan()
        );
        println!(
            "  default_time: {}",
            config.resolver.default_time.as_deref().unwrap_or("종일").cyan()
        );
        Ok(())
    }

    fn config_path_command(&self) -> Result<()> {
        println!("{}", "=== 설정 파일 경로 ===".bold().blue());
        println!(
            "설정 디렉터리: {}",
            self.config_manager
                .get_config_directory_path()
                .display()
                .to_string()
                .cyan()
        );
        println!(
            "설정 파일: {}",
            self.config_manager
                .get_config_file_path()
                .display()
                .to_string()
                .cyan()
        );
        Ok(())
    }
}

fn resolve_date_arg(scheduler: &Scheduler, raw: &str) -> Result<NaiveDate> {
    parse_date_input(scheduler, raw)
        .ok_or_else(|| SchedulerError::ParseError(format!("날짜를 해석할 수 없습니다: {}", raw)).into())
}
