//! File-by-file copy of a home between encryption schemes.
//!
//! The helper walks the mounted source tree and replays it into the
//! mounted destination, reporting progress and honoring cancellation
//! between entries. Promotion of the destination is the orchestrator's
//! job; the helper only moves data.

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Error};
use log::info;

use osutils::platform::Platform;
use storage_api::layout::ROOT_HOME_SUFFIX;

/// How much of the home to migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    /// Everything.
    Full,
    /// Only the root-owned profile state, for users that sign in before
    /// the full data move is scheduled.
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Success,
    Canceled,
}

/// Byte-level progress, delivered after every copied file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationProgress {
    pub current_bytes: u64,
    pub total_bytes: u64,
}

/// Shared cancellation flag, checked by the helper between entries.
#[derive(Clone, Default)]
pub struct CancelFlag(Rc<Cell<bool>>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.0.set(true);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.get()
    }

    pub fn reset(&self) {
        self.0.set(false);
    }
}

pub struct MigrationHelper<'a> {
    platform: &'a dyn Platform,
    cancel: CancelFlag,
}

impl<'a> MigrationHelper<'a> {
    pub fn new(platform: &'a dyn Platform, cancel: CancelFlag) -> Self {
        Self { platform, cancel }
    }

    /// Copies `from` into `to`, preserving ownership and modes. Source
    /// files are deleted as they land so the stateful partition never
    /// needs room for two full copies.
    pub fn migrate(
        &self,
        from: &Path,
        to: &Path,
        mode: MigrationMode,
        progress: &mut dyn FnMut(MigrationProgress),
    ) -> Result<MigrationStatus, Error> {
        let total_bytes = self.tree_size(from, mode)?;
        let mut state = MigrationProgress {
            current_bytes: 0,
            total_bytes,
        };
        progress(state);

        let status = self.migrate_directory(from, to, mode, true, &mut state, progress)?;
        if status == MigrationStatus::Success {
            info!(
                "Migrated {} bytes from '{}' to '{}'",
                state.current_bytes,
                from.display(),
                to.display()
            );
        }
        Ok(status)
    }

    fn in_scope(&self, entry_name: &std::ffi::OsStr, top_level: bool, mode: MigrationMode) -> bool {
        if !top_level || mode == MigrationMode::Full {
            return true;
        }
        entry_name.to_str() == Some(ROOT_HOME_SUFFIX)
    }

    fn tree_size(&self, dir: &Path, mode: MigrationMode) -> Result<u64, Error> {
        self.tree_size_inner(dir, mode, true)
    }

    fn tree_size_inner(&self, dir: &Path, mode: MigrationMode, top_level: bool) -> Result<u64, Error> {
        let mut size = 0;
        for entry in self.platform.list_directory(dir)? {
            let Some(name) = entry.file_name() else {
                continue;
            };
            if !self.in_scope(name, top_level, mode) {
                continue;
            }
            if self.platform.directory_exists(&entry) {
                size += self.tree_size_inner(&entry, mode, false)?;
            } else if let Some(st) = self.platform.stat(&entry)? {
                size += st.size;
            }
        }
        Ok(size)
    }

    fn migrate_directory(
        &self,
        from: &Path,
        to: &Path,
        mode: MigrationMode,
        top_level: bool,
        state: &mut MigrationProgress,
        progress: &mut dyn FnMut(MigrationProgress),
    ) -> Result<MigrationStatus, Error> {
        for entry in self.platform.list_directory(from)? {
            if self.cancel.is_canceled() {
                info!("Migration canceled between entries");
                return Ok(MigrationStatus::Canceled);
            }

            let Some(name) = entry.file_name() else {
                continue;
            };
            if !self.in_scope(name, top_level, mode) {
                continue;
            }
            let target = to.join(name);

            if self.platform.directory_exists(&entry) {
                if !self.platform.directory_exists(&target) {
                    let st = self
                        .platform
                        .stat(&entry)?
                        .context("source directory vanished")?;
                    self.platform.create_dir_with_owner(
                        &target,
                        st.permissions(),
                        st.uid,
                        st.gid,
                    )?;
                }
                let status =
                    self.migrate_directory(&entry, &target, mode, false, state, progress)?;
                if status != MigrationStatus::Success {
                    return Ok(status);
                }
                self.platform.delete_path_recursively(&entry)?;
            } else {
                let st = self.platform.stat(&entry)?.context("source file vanished")?;
                self.platform
                    .copy_file(&entry, &target)
                    .context(format!("Failed to migrate '{}'", entry.display()))?;
                self.platform.set_ownership(&target, st.uid, st.gid)?;
                self.platform.set_permissions(&target, st.permissions())?;
                self.platform.delete_file(&entry)?;

                state.current_bytes += st.size;
                progress(*state);
            }
        }
        Ok(MigrationStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::PathBuf;

    use osutils::testutils::FakePlatform;

    fn fill_source(platform: &FakePlatform, source: &Path) {
        platform
            .create_directory(&source.join("user/docs"))
            .unwrap();
        platform.create_directory(&source.join("root")).unwrap();
        fs::write(
            platform.translate(&source.join("user/docs/a.txt")),
            "aaaa",
        )
        .unwrap();
        fs::write(platform.translate(&source.join("user/b.txt")), "bb").unwrap();
        fs::write(platform.translate(&source.join("root/prefs")), "p").unwrap();
    }

    #[test]
    fn full_migration_moves_everything_with_progress() {
        let platform = FakePlatform::new();
        let source = PathBuf::from("/shadow/u/temporary_mount");
        let target = PathBuf::from("/shadow/u/mount");
        fill_source(&platform, &source);
        platform.create_directory(&target).unwrap();

        let helper = MigrationHelper::new(&platform, CancelFlag::new());
        let mut reports = Vec::new();
        let status = helper
            .migrate(&source, &target, MigrationMode::Full, &mut |p| {
                reports.push(p)
            })
            .unwrap();

        assert_eq!(status, MigrationStatus::Success);
        assert!(platform.file_exists(&target.join("user/docs/a.txt")));
        assert!(platform.file_exists(&target.join("root/prefs")));
        // Sources are consumed as they move.
        assert!(!platform.file_exists(&source.join("user/b.txt")));

        assert_eq!(reports.first().unwrap().total_bytes, 7);
        let last = reports.last().unwrap();
        assert_eq!(last.current_bytes, 7);
        assert_eq!(last.total_bytes, 7);
    }

    #[test]
    fn minimal_migration_copies_only_root_state() {
        let platform = FakePlatform::new();
        let source = PathBuf::from("/shadow/u/temporary_mount");
        let target = PathBuf::from("/shadow/u/mount");
        fill_source(&platform, &source);
        platform.create_directory(&target).unwrap();

        let helper = MigrationHelper::new(&platform, CancelFlag::new());
        let status = helper
            .migrate(&source, &target, MigrationMode::Minimal, &mut |_| {})
            .unwrap();

        assert_eq!(status, MigrationStatus::Success);
        assert!(platform.file_exists(&target.join("root/prefs")));
        assert!(!platform.directory_exists(&target.join("user")));
        // Out-of-scope data stays at the source.
        assert!(platform.file_exists(&source.join("user/b.txt")));
    }

    #[test]
    fn cancellation_stops_between_entries() {
        let platform = FakePlatform::new();
        let source = PathBuf::from("/shadow/u/temporary_mount");
        let target = PathBuf::from("/shadow/u/mount");
        fill_source(&platform, &source);
        platform.create_directory(&target).unwrap();

        let cancel = CancelFlag::new();
        let helper = MigrationHelper::new(&platform, cancel.clone());

        // Cancel as soon as the first file lands.
        let cancel_in_progress = cancel.clone();
        let mut progress = move |p: MigrationProgress| {
            if p.current_bytes > 0 {
                cancel_in_progress.request_cancel();
            }
        };
        let status = helper
            .migrate(&source, &target, MigrationMode::Full, &mut progress)
            .unwrap();

        assert_eq!(status, MigrationStatus::Canceled);
        // The partial destination remains, and some source data is left.
        let remaining = platform.file_exists(&source.join("user/b.txt"))
            || platform.file_exists(&source.join("user/docs/a.txt"))
            || platform.file_exists(&source.join("root/prefs"));
        assert!(remaining);
    }
}
