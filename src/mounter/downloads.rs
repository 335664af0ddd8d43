//! One-way migration of `~/Downloads` into `~/MyFiles/Downloads`.
//!
//! The stage of the migration is recorded in the `user.BindMountMigration`
//! xattr so every mount can converge the home no matter where a previous
//! attempt stopped.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Error};
use log::{info, warn};

use osutils::platform::Platform;
use storage_api::layout::{
    BIND_MOUNT_MIGRATION_XATTR, DOWNLOADS_BACKUP_DIR, DOWNLOADS_DIR, MY_FILES_DIR,
};

const NAME_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStage {
    Unknown,
    Migrating,
    Migrated,
}

impl MigrationStage {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            MigrationStage::Unknown => b"",
            MigrationStage::Migrating => b"migrating",
            MigrationStage::Migrated => b"migrated",
        }
    }
}

/// How the per-mount convergence pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadsMigrationStatus {
    /// Migrated on a prior mount, nothing to do.
    AlreadyMigrated,
    /// Migrated before, but `~/Downloads` reappeared and was drained.
    Reappeared,
    /// Contents were in place but the xattr still said "migrating".
    FixXattr,
    /// Fresh home; marked as migrated without moving anything.
    NewCryptohome,
    /// The directories were exchanged on this pass.
    Success,
}

fn get_migration_stage(platform: &dyn Platform, path: &Path) -> MigrationStage {
    let value = match platform.get_xattr(path, BIND_MOUNT_MIGRATION_XATTR) {
        Ok(Some(value)) => value,
        Ok(None) => return MigrationStage::Unknown,
        Err(e) => {
            warn!(
                "Cannot read xattr {BIND_MOUNT_MIGRATION_XATTR} of '{}': {e:#}",
                path.display()
            );
            return MigrationStage::Unknown;
        }
    };
    match value.as_slice() {
        b"migrating" => MigrationStage::Migrating,
        b"migrated" => MigrationStage::Migrated,
        other => {
            warn!(
                "Unexpected value '{}' for xattr {BIND_MOUNT_MIGRATION_XATTR} on '{}'",
                String::from_utf8_lossy(other),
                path.display()
            );
            MigrationStage::Unknown
        }
    }
}

fn set_migration_stage(
    platform: &dyn Platform,
    path: &Path,
    stage: MigrationStage,
) -> Result<(), Error> {
    platform
        .set_xattr(path, BIND_MOUNT_MIGRATION_XATTR, stage.as_bytes())
        .context(format!(
            "Cannot set xattr {BIND_MOUNT_MIGRATION_XATTR} on '{}'",
            path.display()
        ))
}

/// Removes the stage xattr so a future migration can run again after the
/// home fell back to bind-mount mode.
pub fn clear_migration_stage(platform: &dyn Platform, user_home: &Path) {
    let downloads_in_my_files = user_home.join(MY_FILES_DIR).join(DOWNLOADS_DIR);
    match platform.remove_xattr(&downloads_in_my_files, BIND_MOUNT_MIGRATION_XATTR) {
        Ok(true) => info!(
            "Removed xattr {BIND_MOUNT_MIGRATION_XATTR} from '{}'",
            downloads_in_my_files.display()
        ),
        Ok(false) => {}
        Err(e) => warn!("Cannot remove migration xattr: {e:#}"),
    }
}

/// Converges the user home on `~/MyFiles/Downloads` holding the downloads.
/// On error the caller falls back to the bind-mount layout, so the home
/// stays usable either way.
pub fn move_downloads_to_my_files(
    platform: &dyn Platform,
    user_home: &Path,
) -> Result<DownloadsMigrationStatus, Error> {
    let downloads = user_home.join(DOWNLOADS_DIR);
    let downloads_in_my_files = user_home.join(MY_FILES_DIR).join(DOWNLOADS_DIR);

    let stage = get_migration_stage(platform, &downloads_in_my_files);

    if stage == MigrationStage::Migrated {
        info!("The Downloads folder is already marked as migrated");

        let mut status = DownloadsMigrationStatus::AlreadyMigrated;
        if platform.directory_exists(&downloads) {
            warn!("The ~/Downloads folder reappeared after its migration");
            status = DownloadsMigrationStatus::Reappeared;
            move_directory_contents(platform, &downloads, &downloads_in_my_files);
            match platform.delete_file(&downloads) {
                Ok(()) => info!("Removed the reappeared ~/Downloads folder"),
                Err(e) => warn!("Cannot remove the reappeared ~/Downloads folder: {e:#}"),
            }
        }

        // An old interrupted run may have left a backup directory around.
        let downloads_backup = user_home.join(DOWNLOADS_BACKUP_DIR);
        if platform.directory_exists(&downloads_backup) {
            move_directory_contents(platform, &downloads_backup, &downloads_in_my_files);
            match platform.delete_file(&downloads_backup) {
                Ok(()) => info!("Deleted the old ~/Downloads-backup folder"),
                Err(e) => warn!("Cannot delete the old ~/Downloads-backup folder: {e:#}"),
            }
        }

        return Ok(status);
    }

    // ~/Downloads gone but ~/MyFiles/Downloads present: either a fresh home
    // or a previous pass that died before updating the xattr.
    if !platform.directory_exists(&downloads) && platform.directory_exists(&downloads_in_my_files) {
        let status = if stage == MigrationStage::Migrating {
            info!("Downloads are in place but still marked as migrating");
            DownloadsMigrationStatus::FixXattr
        } else {
            info!("It looks like a new cryptohome");
            DownloadsMigrationStatus::NewCryptohome
        };
        // Even if the xattr cannot be updated the home remains usable.
        if let Err(e) = set_migration_stage(platform, &downloads_in_my_files, MigrationStage::Migrated)
        {
            warn!("Cannot mark the Downloads folder as migrated: {e:#}");
        }
        return Ok(status);
    }

    // Drain ~/MyFiles/Downloads so the exchange below leaves nothing
    // masked, then mark ~/Downloads as mid-migration.
    move_directory_contents(platform, &downloads_in_my_files, &downloads);

    set_migration_stage(platform, &downloads, MigrationStage::Migrating)?;

    platform
        .exchange(&downloads, &downloads_in_my_files)
        .context("Cannot exchange ~/Downloads and ~/MyFiles/Downloads")?;
    info!("Moved ~/Downloads into ~/MyFiles");

    match platform.delete_file(&downloads) {
        Ok(()) => info!("Deleted old ~/Downloads folder"),
        Err(e) => warn!("Cannot delete old ~/Downloads folder: {e:#}"),
    }

    if let Err(e) = set_migration_stage(platform, &downloads_in_my_files, MigrationStage::Migrated) {
        // The move itself succeeded; the next mount fixes the xattr.
        warn!("Cannot mark the Downloads folder as migrated: {e:#}");
        return Ok(DownloadsMigrationStatus::Success);
    }

    info!("The ~/Downloads folder was migrated to ~/MyFiles/Downloads");
    Ok(DownloadsMigrationStatus::Success)
}

/// Moves every direct child of `from_dir` into `to_dir`, renaming on
/// collision. Failures are logged per item and never stop the sweep.
pub fn move_directory_contents(platform: &dyn Platform, from_dir: &Path, to_dir: &Path) {
    let entries = match platform.list_directory(from_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot enumerate '{}': {e:#}", from_dir.display());
            return;
        }
    };

    let mut probe_counts = ProbeCounts::new();
    let mut moved = 0usize;
    for entry in &entries {
        if move_with_conflict_resolution(platform, entry, to_dir, &mut probe_counts) {
            moved += 1;
        }
    }
    if moved != 0 {
        info!(
            "Moved {moved} items from '{}' to '{}'",
            from_dir.display(),
            to_dir.display()
        );
    }
}

/// Per-base-name probe counters, so repeated collisions on the same name
/// do not rescan the same suffixes over and over.
pub type ProbeCounts = HashMap<String, i32>;

fn move_with_conflict_resolution(
    platform: &dyn Platform,
    from: &Path,
    to_dir: &Path,
    probe_counts: &mut ProbeCounts,
) -> bool {
    let Some(name) = from.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        warn!("Cannot move '{}': no file name", from.display());
        return false;
    };

    // Try the plain name first.
    match platform.rename_no_replace(from, &to_dir.join(&name)) {
        Ok(()) => return true,
        Err(e) if e.raw_os_error() != Some(libc::EEXIST) => {
            warn!("Cannot move '{}': {e}", from.display());
            return false;
        }
        Err(_) => {}
    }

    // Name collision: probe "<stem> (<k>)<ext>" for growing k.
    let is_file = platform
        .stat(from)
        .ok()
        .flatten()
        .map(|st| !st.is_dir())
        .unwrap_or(false);
    let (mut stem, ext) = split_extension(&name, is_file);
    remove_numeric_suffix(&mut stem);

    let counter = probe_counts.entry(format!("{stem}{ext}")).or_insert(0);
    loop {
        *counter += 1;
        if *counter == i32::MAX {
            warn!(
                "Cannot move '{}' to '{}': too many collisions",
                from.display(),
                to_dir.display()
            );
            return false;
        }

        let suffix = format!(" ({counter}){ext}");
        let to = to_dir.join(format!(
            "{}{suffix}",
            truncate_utf8(&stem, NAME_MAX.saturating_sub(suffix.len()))
        ));
        match platform.rename_no_replace(from, &to) {
            Ok(()) => return true,
            Err(e) if e.raw_os_error() != Some(libc::EEXIST) => {
                warn!("Cannot move '{}' to '{}': {e}", from.display(), to.display());
                return false;
            }
            Err(_) => {}
        }
    }
}

// Compressed archives keep their compound extension together.
const COMPOUND_FINAL_EXTENSIONS: &[&str] = &["gz", "z", "bz2", "xz", "zst"];

fn final_extension(name: &str) -> &str {
    // A leading dot alone marks a hidden file, not an extension.
    match name
        .char_indices()
        .skip(1)
        .filter(|(_, c)| *c == '.')
        .last()
    {
        Some((index, _)) => &name[index..],
        None => "",
    }
}

fn split_extension(name: &str, is_file: bool) -> (String, String) {
    if !is_file || name.ends_with('.') || name.len() < 2 {
        return (name.to_owned(), String::new());
    }

    let last = final_extension(name);
    let mut ext = last.to_owned();
    if COMPOUND_FINAL_EXTENSIONS.contains(&last.trim_start_matches('.').to_lowercase().as_str()) {
        let head = &name[..name.len() - last.len()];
        let previous = final_extension(head);
        if !previous.is_empty() {
            ext = format!("{previous}{last}");
        }
    }

    // Oversized or space-carrying "extensions" are part of the name.
    if ext.len() == name.len() || ext.len() > 12 || ext.contains(' ') {
        ext = final_extension(name).to_owned();
        if ext.len() == name.len() || ext.len() > 6 || ext.contains(' ') {
            ext.clear();
        }
    }

    let stem = name[..name.len() - ext.len()].to_owned();
    (stem, ext)
}

// Strips a trailing " (N)" so renaming a prior rename does not stack
// suffixes.
fn remove_numeric_suffix(name: &mut String) {
    let Some(open) = name.rfind(" (") else {
        return;
    };
    if !name.ends_with(')') {
        return;
    }
    let digits = &name[open + 2..name.len() - 1];
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        name.truncate(open);
    }
}

const ZERO_WIDTH_JOINER: char = '\u{200d}';

/// Truncates to at most `max_bytes` without splitting a code point and
/// without ending on a zero-width joiner.
fn truncate_utf8(name: &str, max_bytes: usize) -> &str {
    if name.len() <= max_bytes {
        return name;
    }
    let mut end = max_bytes;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = &name[..end];
    while truncated.ends_with(ZERO_WIDTH_JOINER) {
        truncated = &truncated[..truncated.len() - ZERO_WIDTH_JOINER.len_utf8()];
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use osutils::testutils::FakePlatform;

    const USER_HOME: &str = "/home/.shadow/u/mount/user";

    fn home() -> PathBuf {
        PathBuf::from(USER_HOME)
    }

    fn downloads() -> PathBuf {
        home().join(DOWNLOADS_DIR)
    }

    fn downloads_in_my_files() -> PathBuf {
        home().join(MY_FILES_DIR).join(DOWNLOADS_DIR)
    }

    fn write(platform: &FakePlatform, path: &Path, content: &str) {
        std::fs::write(platform.translate(path), content).unwrap();
    }

    fn read(platform: &FakePlatform, path: &Path) -> String {
        std::fs::read_to_string(platform.translate(path)).unwrap()
    }

    fn stage(platform: &FakePlatform) -> MigrationStage {
        get_migration_stage(platform as &dyn Platform, &downloads_in_my_files())
    }

    #[test]
    fn fresh_vault_is_marked_migrated() {
        let platform = FakePlatform::new();
        platform.create_directory(&downloads_in_my_files()).unwrap();

        let status = move_downloads_to_my_files(&platform, &home()).unwrap();
        assert_eq!(status, DownloadsMigrationStatus::NewCryptohome);
        assert_eq!(stage(&platform), MigrationStage::Migrated);

        // The next mount is a no-op.
        let status = move_downloads_to_my_files(&platform, &home()).unwrap();
        assert_eq!(status, DownloadsMigrationStatus::AlreadyMigrated);
    }

    #[test]
    fn interrupted_migration_fixes_the_xattr() {
        let platform = FakePlatform::new();
        platform.create_directory(&downloads_in_my_files()).unwrap();
        set_migration_stage(
            &platform as &dyn Platform,
            &downloads_in_my_files(),
            MigrationStage::Migrating,
        )
        .unwrap();

        let status = move_downloads_to_my_files(&platform, &home()).unwrap();
        assert_eq!(status, DownloadsMigrationStatus::FixXattr);
        assert_eq!(stage(&platform), MigrationStage::Migrated);
    }

    #[test]
    fn full_migration_exchanges_directories() {
        let platform = FakePlatform::new();
        platform.create_directory(&downloads()).unwrap();
        platform.create_directory(&downloads_in_my_files()).unwrap();
        write(&platform, &downloads().join("song.mp3"), "downloads");
        write(
            &platform,
            &downloads_in_my_files().join("stray.txt"),
            "stray",
        );

        let status = move_downloads_to_my_files(&platform, &home()).unwrap();
        assert_eq!(status, DownloadsMigrationStatus::Success);
        assert_eq!(stage(&platform), MigrationStage::Migrated);

        // Old path is gone; all content lives in ~/MyFiles/Downloads.
        assert!(!platform.directory_exists(&downloads()));
        assert_eq!(
            read(&platform, &downloads_in_my_files().join("song.mp3")),
            "downloads"
        );
        assert_eq!(
            read(&platform, &downloads_in_my_files().join("stray.txt")),
            "stray"
        );

        // Idempotent: a second pass reports "already migrated".
        let status = move_downloads_to_my_files(&platform, &home()).unwrap();
        assert_eq!(status, DownloadsMigrationStatus::AlreadyMigrated);
    }

    #[test]
    fn reappeared_downloads_are_drained() {
        let platform = FakePlatform::new();
        platform.create_directory(&downloads_in_my_files()).unwrap();
        move_downloads_to_my_files(&platform, &home()).unwrap();

        platform.create_directory(&downloads()).unwrap();
        write(&platform, &downloads().join("late.txt"), "late");

        let status = move_downloads_to_my_files(&platform, &home()).unwrap();
        assert_eq!(status, DownloadsMigrationStatus::Reappeared);
        assert!(!platform.directory_exists(&downloads()));
        assert_eq!(
            read(&platform, &downloads_in_my_files().join("late.txt")),
            "late"
        );
    }

    #[test]
    fn collisions_get_numbered_names() {
        let platform = FakePlatform::new();
        let from = Path::new("/from");
        let to = Path::new("/to");
        platform.create_directory(from).unwrap();
        platform.create_directory(to).unwrap();

        write(&platform, &from.join("a.txt"), "new");
        write(&platform, &to.join("a.txt"), "old");
        write(&platform, &to.join("a (1).txt"), "older");

        move_directory_contents(&platform as &dyn Platform, from, to);
        assert_eq!(read(&platform, &to.join("a.txt")), "old");
        assert_eq!(read(&platform, &to.join("a (2).txt")), "new");
    }

    #[test]
    fn renamed_items_do_not_stack_suffixes() {
        let platform = FakePlatform::new();
        let from = Path::new("/from");
        let to = Path::new("/to");
        platform.create_directory(from).unwrap();
        platform.create_directory(to).unwrap();

        write(&platform, &from.join("a (1).txt"), "new");
        write(&platform, &to.join("a (1).txt"), "old");

        move_directory_contents(&platform as &dyn Platform, from, to);
        // "a (1)" collapses to base "a", then probes from " (1)".
        assert_eq!(read(&platform, &to.join("a (2).txt")), "new");
    }

    #[test]
    fn longest_name_still_fits_name_max() {
        let platform = FakePlatform::new();
        let from = Path::new("/from");
        let to = Path::new("/to");
        platform.create_directory(from).unwrap();
        platform.create_directory(to).unwrap();

        let name = format!("{}.txt", "a".repeat(NAME_MAX - 4));
        write(&platform, &from.join(&name), "new");
        write(&platform, &to.join(&name), "old");

        move_directory_contents(&platform as &dyn Platform, from, to);

        let produced: Vec<String> = platform
            .list_directory(to)
            .unwrap()
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(produced.len(), 2);
        for name in &produced {
            assert!(name.len() <= NAME_MAX, "{} is above NAME_MAX", name.len());
        }
        assert!(produced.iter().any(|n| n.ends_with(" (1).txt")));
    }

    #[test]
    fn extension_splitting() {
        assert_eq!(split_extension("a.txt", true), ("a".into(), ".txt".into()));
        assert_eq!(
            split_extension("archive.tar.gz", true),
            ("archive".into(), ".tar.gz".into())
        );
        // Directories keep their dots.
        assert_eq!(split_extension("a.txt", false), ("a.txt".into(), "".into()));
        // Hidden files have no extension to preserve.
        assert_eq!(
            split_extension(".bashrc", true),
            (".bashrc".into(), "".into())
        );
        // Spaces after the dot mean it is not an extension.
        assert_eq!(
            split_extension("v1. final", true),
            ("v1. final".into(), "".into())
        );
    }

    #[test]
    fn numeric_suffix_removal() {
        for (input, expected) in [
            ("a (1)", "a"),
            ("a (12)", "a"),
            ("a (x)", "a (x)"),
            ("a ()", "a ()"),
            ("a(1)", "a(1)"),
        ] {
            let mut name = input.to_owned();
            remove_numeric_suffix(&mut name);
            assert_eq!(name, expected, "for input '{input}'");
        }
    }

    #[test]
    fn utf8_truncation_respects_boundaries() {
        // Multibyte char straddling the limit is dropped entirely.
        let name = format!("{}\u{00e9}tail", "a".repeat(9));
        assert_eq!(truncate_utf8(&name, 10), "a".repeat(9));

        // A zero-width joiner is never the final character.
        let name = format!("ab\u{200d}cd");
        assert_eq!(truncate_utf8(&name, 5), "ab");

        assert_eq!(truncate_utf8("short", 255), "short");
    }
}
