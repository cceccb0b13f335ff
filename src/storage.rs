use crate::models::{Event, EventPatch, EventStore, Schedule};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub struct Storage {
    data_dir: PathBuf,
    schedule_file: PathBuf,
}

impl Storage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let schedule_file = data_dir.join("schedule.json");

        // データディレクトリが存在しない場合は作成
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
            info!(path = %data_dir.display(), "データディレクトリを作成しました");
        }

        Ok(Self {
            data_dir,
            schedule_file,
        })
    }

    pub fn schedule_file(&self) -> &Path {
        &self.schedule_file
    }

    /// 一時ファイルに書いてから置き換える
    pub fn save_schedule(&self, schedule: &Schedule) -> Result<()> {
        let json_data = serde_json::to_string_pretty(schedule)?;
        let tmp_file = self.schedule_file.with_extension("json.tmp");
        fs::write(&tmp_file, json_data)?;
        fs::rename(&tmp_file, &self.schedule_file)?;
        debug!(path = %self.schedule_file.display(), events = schedule.events.len(), "スケジュールを保存");
        Ok(())
    }

    pub fn load_schedule(&self) -> Result<Schedule> {
        if !self.schedule_file.exists() {
            return Ok(Schedule::new());
        }

        let json_data = fs::read_to_string(&self.schedule_file)?;
        let schedule: Schedule = serde_json::from_str(&json_data)
            .with_context(|| format!("{} を読み込めません", self.schedule_file.display()))?;
        Ok(schedule)
    }

    pub fn backup_schedule(&self) -> Result<PathBuf> {
        if !self.schedule_file.exists() {
            return Err(anyhow!("백업할 일정 파일이 없습니다"));
        }

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_file = self
            .data_dir
            .join(format!("schedule_backup_{}.json", timestamp));

        fs::copy(&self.schedule_file, &backup_file)?;
        Ok(backup_file)
    }

    pub fn export_schedule(&self, export_path: &Path) -> Result<()> {
        if !self.schedule_file.exists() {
            return Err(anyhow!("내보낼 일정 파일이 없습니다"));
        }

        fs::copy(&self.schedule_file, export_path)?;
        Ok(())
    }

    pub fn import_schedule(&self, import_path: &Path) -> Result<Schedule> {
        if !import_path.exists() {
            return Err(anyhow!("가져올 파일이 없습니다: {}", import_path.display()));
        }

        let json_data = fs::read_to_string(import_path)?;
        let schedule: Schedule = serde_json::from_str(&json_data)?;
        Ok(schedule)
    }
}

/// 変更のたびに全体を書き出す `EventStore`
pub struct FileEventStore {
    schedule: Schedule,
    storage: Storage,
}

impl FileEventStore {
    pub fn open(storage: Storage) -> Result<Self> {
        let schedule = storage.load_schedule()?;
        Ok(Self { schedule, storage })
    }
}

impl EventStore for FileEventStore {
    fn list(&self) -> Vec<Event> {
        self.schedule.list()
    }

    fn add(&mut self, event: Event) -> Result<Event> {
        let mut next = self.schedule.clone();
        let added = next.add(event)?;
        self.storage.save_schedule(&next)?;
        self.schedule = next;
        Ok(added)
    }

    fn remove(&mut self, id: Uuid) -> Result<bool> {
        let mut next = self.schedule.clone();
        if !next.remove(id)? {
            return Ok(false);
        }
        self.storage.save_schedule(&next)?;
        self.schedule = next;
        Ok(true)
    }

    fn update(&mut self, id: Uuid, patch: EventPatch) -> Result<bool> {
        let mut next = self.schedule.clone();
        if !next.update(id, patch)? {
            return Ok(false);
        }
        self.storage.save_schedule(&next)?;
        self.schedule = next;
        Ok(true)
    }

    fn list_by_date(&self, date: chrono::NaiveDate) -> Vec<Event> {
        self.schedule.list_by_date(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_missing_file_loads_empty_schedule() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = Storage::new(dir.path().join("data"))?;
        assert!(storage.load_schedule()?.events.is_empty());
        Ok(())
    }

    #[test]
    fn test_file_store_persists_every_mutation() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = FileEventStore::open(Storage::new(dir.path())?)?;

        let event = store.add(Event::new("회의", date(2025, 3, 11))?)?;
        store.update(event.id, EventPatch { completed: Some(true) })?;

        let reopened = FileEventStore::open(Storage::new(dir.path())?)?;
        let events = reopened.list_by_date(date(2025, 3, 11));
        assert_eq!(events.len(), 1);
        assert!(events[0].completed);

        let mut reopened = reopened;
        assert!(reopened.remove(event.id)?);
        assert!(!reopened.remove(event.id)?);
        let again = Storage::new(dir.path())?.load_schedule()?;
        assert!(again.events.is_empty());
        Ok(())
    }

    #[test]
    fn test_backup_export_import() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = Storage::new(dir.path())?;
        assert!(storage.backup_schedule().is_err());

        let mut schedule = Schedule::new();
        schedule.add_event(Event::new("출장", date(2025, 4, 1))?);
        storage.save_schedule(&schedule)?;

        let backup = storage.backup_schedule()?;
        assert!(backup.exists());

        let export_path = dir.path().join("export.json");
        storage.export_schedule(&export_path)?;
        let imported = storage.import_schedule(&export_path)?;
        assert_eq!(imported.events.len(), 1);
        assert_eq!(imported.events[0].title, "출장");
        Ok(())
    }

    #[test]
    fn test_corrupt_file_is_an_error() -> Result<()> {
        let dir = TempDir::new()?;
        let storage = Storage::new(dir.path())?;
        fs::write(storage.schedule_file(), "not json")?;
        assert!(storage.load_schedule().is_err());
        Ok(())
    }
}
