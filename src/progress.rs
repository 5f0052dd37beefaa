//! Learner progress: completed lessons and unlocked achievements.
//!
//! Persisted as one JSON file under the platform data dir
//! (`<data_dir>/live-interview/progress.json`). A missing or unreadable file
//! starts from a fresh store; it is never fatal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::{write_atomic, APP_DIR_NAME};

const PROGRESS_FILE_NAME: &str = "progress.json";

pub const ACHIEVEMENT_QUIZ: &str = "quiz";
pub const ACHIEVEMENT_CODE: &str = "code";
pub const ACHIEVEMENT_INTERVIEW: &str = "interview";
pub const ACHIEVEMENT_MODULE: &str = "module";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Achievement {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub unlocked_at: Option<DateTime<Utc>>,
}

impl Achievement {
    fn new(id: &str, title: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            unlocked_at: None,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked_at.is_some()
    }
}

/// The badges every learner starts with, all locked
pub fn default_achievements() -> Vec<Achievement> {
    vec![
        Achievement::new(ACHIEVEMENT_QUIZ, "Quiz Whiz", "Complete a quiz"),
        Achievement::new(ACHIEVEMENT_CODE, "Code Craftsman", "Get a code review"),
        Achievement::new(ACHIEVEMENT_INTERVIEW, "Pro Orator", "Finish a live practice"),
        Achievement::new(
            ACHIEVEMENT_MODULE,
            "Chapter Master",
            "Finish all lessons in a module",
        ),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Progress {
    completed_lessons: BTreeMap<String, DateTime<Utc>>,
    achievements: Vec<Achievement>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            completed_lessons: BTreeMap::new(),
            achievements: default_achievements(),
        }
    }
}

/// File-backed progress store
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
    progress: Progress,
}

impl ProgressStore {
    pub fn default_path() -> Result<PathBuf, String> {
        let dir =
            dirs::data_dir().ok_or_else(|| "Could not determine data directory".to_string())?;
        Ok(dir.join(APP_DIR_NAME).join(PROGRESS_FILE_NAME))
    }

    /// Load from `path`, starting fresh if it is missing or corrupt
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let progress = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Progress>(&contents) {
                Ok(progress) => progress,
                Err(e) => {
                    log::warn!("Progress: failed to parse {:?}: {}", path, e);
                    Progress::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Progress::default(),
            Err(e) => {
                log::warn!("Progress: failed to read {:?}: {}", path, e);
                Progress::default()
            }
        };

        Self { path, progress }
    }

    pub fn save(&self) -> Result<(), String> {
        let contents = serde_json::to_string_pretty(&self.progress)
            .map_err(|e| format!("Serialize progress: {}", e))?;
        write_atomic(&self.path, &contents)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark a lesson done. Finishing a lesson's quiz also earns the quiz badge.
    /// Returns true if the lesson was not completed before.
    pub fn complete_lesson(&mut self, lesson_id: &str) -> bool {
        let newly = !self.progress.completed_lessons.contains_key(lesson_id);
        if newly {
            self.progress
                .completed_lessons
                .insert(lesson_id.to_string(), Utc::now());
            log::info!("Progress: lesson {} completed", lesson_id);
        }
        self.unlock(ACHIEVEMENT_QUIZ);
        newly
    }

    /// Like `complete_lesson`, and earns the module badge once every lesson
    /// of `module_lessons` is done
    pub fn complete_module_lesson(&mut self, lesson_id: &str, module_lessons: &[&str]) -> bool {
        let newly = self.complete_lesson(lesson_id);
        if !module_lessons.is_empty() && module_lessons.iter().all(|id| self.is_completed(id)) {
            self.unlock(ACHIEVEMENT_MODULE);
        }
        newly
    }

    pub fn is_completed(&self, lesson_id: &str) -> bool {
        self.progress.completed_lessons.contains_key(lesson_id)
    }

    pub fn completed_at(&self, lesson_id: &str) -> Option<DateTime<Utc>> {
        self.progress.completed_lessons.get(lesson_id).copied()
    }

    pub fn completed_count(&self) -> usize {
        self.progress.completed_lessons.len()
    }

    /// Completed share of `total_lessons`, rounded to a whole percent
    pub fn mastery_percentage(&self, total_lessons: usize) -> u32 {
        if total_lessons == 0 {
            return 0;
        }
        let ratio = self.completed_count().min(total_lessons) as f64 / total_lessons as f64;
        (ratio * 100.0).round() as u32
    }

    /// Unlock an achievement. Returns true only on the first unlock of a
    /// known id.
    pub fn unlock(&mut self, achievement_id: &str) -> bool {
        match self
            .progress
            .achievements
            .iter_mut()
            .find(|a| a.id == achievement_id)
        {
            Some(achievement) if !achievement.is_unlocked() => {
                achievement.unlocked_at = Some(Utc::now());
                log::info!("Progress: achievement {} unlocked", achievement_id);
                true
            }
            Some(_) => false,
            None => {
                log::debug!("Progress: unknown achievement {}", achievement_id);
                false
            }
        }
    }

    pub fn is_unlocked(&self, achievement_id: &str) -> bool {
        self.progress
            .achievements
            .iter()
            .any(|a| a.id == achievement_id && a.is_unlocked())
    }

    pub fn achievements(&self) -> &[Achievement] {
        &self.progress.achievements
    }

    pub fn unlocked(&self) -> Vec<&Achievement> {
        self.progress
            .achievements
            .iter()
            .filter(|a| a.is_unlocked())
            .collect()
    }
}

/// Quiz check: the selected option must be the correct one
pub fn answer_is_correct(selected: Option<usize>, correct: usize) -> bool {
    selected == Some(correct)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ProgressStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::load(dir.path().join("progress.json"));
        (dir, store)
    }

    #[test]
    fn test_fresh_store_has_locked_badges() {
        let (_dir, store) = store();
        assert_eq!(store.completed_count(), 0);
        assert_eq!(store.achievements().len(), 4);
        assert!(store.unlocked().is_empty());
    }

    #[test]
    fn test_complete_lesson_is_idempotent() {
        let (_dir, mut store) = store();
        assert!(store.complete_lesson("closures"));
        assert!(!store.complete_lesson("closures"));

        assert!(store.is_completed("closures"));
        assert!(store.completed_at("closures").is_some());
        assert_eq!(store.completed_count(), 1);
        assert!(store.is_unlocked(ACHIEVEMENT_QUIZ));
    }

    #[test]
    fn test_module_badge_after_all_lessons() {
        let (_dir, mut store) = store();
        let module = ["a", "b"];

        store.complete_module_lesson("a", &module);
        assert!(!store.is_unlocked(ACHIEVEMENT_MODULE));

        store.complete_module_lesson("b", &module);
        assert!(store.is_unlocked(ACHIEVEMENT_MODULE));
    }

    #[test]
    fn test_unlock_only_once_and_unknown_ids() {
        let (_dir, mut store) = store();
        assert!(store.unlock(ACHIEVEMENT_INTERVIEW));
        assert!(!store.unlock(ACHIEVEMENT_INTERVIEW));
        assert!(!store.unlock("does-not-exist"));
        assert_eq!(store.unlocked().len(), 1);
    }

    #[test]
    fn test_mastery_percentage() {
        let (_dir, mut store) = store();
        assert_eq!(store.mastery_percentage(0), 0);

        store.complete_lesson("a");
        assert_eq!(store.mastery_percentage(3), 33);
        store.complete_lesson("b");
        assert_eq!(store.mastery_percentage(3), 67);
    }

    #[test]
    fn test_save_and_reload() {
        let (dir, mut store) = store();
        store.complete_lesson("hooks");
        store.unlock(ACHIEVEMENT_CODE);
        store.save().unwrap();

        let reloaded = ProgressStore::load(dir.path().join("progress.json"));
        assert!(reloaded.is_completed("hooks"));
        assert!(reloaded.is_unlocked(ACHIEVEMENT_CODE));
        assert!(!reloaded.is_unlocked(ACHIEVEMENT_INTERVIEW));
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "[1, 2").unwrap();

        let store = ProgressStore::load(&path);
        assert_eq!(store.completed_count(), 0);
        assert_eq!(store.achievements().len(), 4);
    }

    #[test]
    fn test_answer_is_correct() {
        assert!(answer_is_correct(Some(2), 2));
        assert!(!answer_is_correct(Some(1), 2));
        assert!(!answer_is_correct(None, 0));
    }
}
