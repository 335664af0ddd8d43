use super::*;

use osutils::testutils::FakePlatform;

fn user() -> ObfuscatedUsername {
    ObfuscatedUsername::from_sanitized("0123456789abcdef").unwrap()
}

struct Fixture {
    platform: FakePlatform,
}

impl Fixture {
    fn new() -> Self {
        let platform = FakePlatform::new();
        // Base tree normally provided by init.
        for dir in [
            "/home/user",
            "/home/root",
            "/home/chronos/user",
            "/etc/skel",
            "/run/cryptohome",
        ] {
            platform.create_directory(Path::new(dir)).unwrap();
        }
        // /home/chronos belongs to the session user.
        platform
            .create_dir_with_owner(Path::new("/home/chronos"), 0o755, 1000, 1000)
            .unwrap();
        Self { platform }
    }

    fn mounter(&self, legacy: bool, bind_downloads: bool) -> Mounter<'_> {
        Mounter::new(&self.platform, legacy, bind_downloads)
    }

    fn add_skeleton_file(&self, name: &str, content: &str) {
        std::fs::write(
            self.platform.translate(&Path::new(layout::SKEL_DIR).join(name)),
            content,
        )
        .unwrap();
    }

    fn add_daemon_store(&self, daemon: &str) {
        let etc = Path::new(layout::ETC_DAEMON_STORE_BASE_DIR).join(daemon);
        self.platform.create_directory(&etc).unwrap();
        self.platform
            .create_dir_with_owner(&etc, 0o770, 42, 42)
            .unwrap();
        self.platform
            .create_directory(&Path::new(layout::RUN_DAEMON_STORE_BASE_DIR).join(daemon))
            .unwrap();
        self.platform
            .create_directory(&Path::new(layout::RUN_DAEMON_STORE_CACHE_BASE_DIR).join(daemon))
            .unwrap();
    }

    fn prepare_dmcrypt_volumes(&self) {
        // The container layer exposes the dm devices before the mounter
        // runs; the fake only needs the tables for path resolution.
        self.platform
            .dm_create("dmcrypt-01234567-data", "0 2048 crypt")
            .unwrap();
        self.platform
            .dm_create("dmcrypt-01234567-cache", "0 2048 crypt")
            .unwrap();
    }

    fn prepare_ecryptfs_vault(&self) {
        self.platform
            .create_directory(&layout::ecryptfs_vault_path(&user()))
            .unwrap();
        self.platform
            .create_directory(&layout::user_mount_directory(&user()))
            .unwrap();
    }

    fn prepare_fscrypt_home(&self) {
        self.platform
            .create_directory(&layout::user_mount_directory(&user()))
            .unwrap();
    }

    fn mounted_targets(&self) -> Vec<PathBuf> {
        self.platform.mounts().iter().map(|(_, d)| d.clone()).collect()
    }
}

#[test]
fn dircrypto_mount_builds_home_graph() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    fixture.add_daemon_store("shill");
    let mut mounter = fixture.mounter(true, false);

    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();

    let targets = fixture.mounted_targets();
    for expected in [
        "/home/user/0123456789abcdef",
        "/home/root/0123456789abcdef",
        "/home/chronos/u-0123456789abcdef",
        "/home/chronos/user",
        "/run/daemon-store/shill/0123456789abcdef",
        "/run/daemon-store-cache/shill/0123456789abcdef",
    ] {
        assert!(
            targets.contains(&PathBuf::from(expected)),
            "missing mount target {expected}; got {targets:?}"
        );
    }
}

#[test]
fn dircrypto_mount_tags_tracked_directories() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    let mut mounter = fixture.mounter(false, false);

    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();

    let mount = layout::user_mount_directory(&user());
    for (path, expected) in [
        (mount.join("user"), b"user".as_slice()),
        (mount.join("user/GCache"), b"GCache".as_slice()),
        (mount.join("user/GCache/v2"), b"v2".as_slice()),
        (mount.join("root"), b"root".as_slice()),
    ] {
        assert_eq!(
            fixture
                .platform
                .get_xattr(&path, layout::TRACKED_DIRECTORY_NAME_XATTR)
                .unwrap()
                .as_deref(),
            Some(expected),
            "for {}",
            path.display()
        );
    }

    // Ownership and modes of the tracked set.
    let st = fixture.platform.stat(&mount.join("root")).unwrap().unwrap();
    assert_eq!((st.uid, st.gid, st.permissions()), (0, 400, 0o1770));
    let st = fixture.platform.stat(&mount.join("user/Cache")).unwrap().unwrap();
    assert_eq!((st.uid, st.gid, st.permissions()), (1000, 1000, 0o700));
}

#[test]
fn ecryptfs_mount_uses_signature_options() {
    let fixture = Fixture::new();
    fixture.prepare_ecryptfs_vault();
    let mut mounter = fixture.mounter(false, false);

    mounter
        .perform_mount(MountType::Ecryptfs, &user(), "aabb", "ccdd")
        .unwrap();

    let details = fixture.platform.mount_details();
    let (src, dst, fstype, options) = &details[0];
    assert_eq!(src, &layout::ecryptfs_vault_path(&user()));
    assert_eq!(dst, &layout::user_mount_directory(&user()));
    assert_eq!(fstype, "ecryptfs");
    assert_eq!(
        options,
        "ecryptfs_cipher=aes,ecryptfs_key_bytes=16,ecryptfs_fnek_sig=ccdd,\
         ecryptfs_sig=aabb,ecryptfs_unlink_sigs"
    );
}

#[test]
fn dmcrypt_mount_includes_cache_volume() {
    let fixture = Fixture::new();
    fixture.prepare_dmcrypt_volumes();
    fixture.add_daemon_store("shill");
    let mut mounter = fixture.mounter(false, false);

    mounter
        .perform_mount(MountType::Dmcrypt, &user(), "fek", "fnek")
        .unwrap();

    let targets = fixture.mounted_targets();
    let mount = layout::user_mount_directory(&user());
    assert!(targets.contains(&mount));
    assert!(targets.contains(&layout::dmcrypt_user_cache_directory(&user())));
    // Cache-only subdirectories are folded into the data mount.
    for cache_bind in ["user/Cache", "user/GCache", "root/.cache"] {
        assert!(
            targets.contains(&mount.join(cache_bind)),
            "missing cache bind {cache_bind}"
        );
    }

    let details = fixture.platform.mount_details();
    assert_eq!(details[0].2, "ext4");
    assert_eq!(details[0].3, "discard,commit=600");
}

#[test]
fn migrating_mount_stops_before_home_graph() {
    let fixture = Fixture::new();
    fixture.prepare_ecryptfs_vault();
    fixture.prepare_fscrypt_home();
    let mut mounter = fixture.mounter(true, false);

    mounter
        .perform_mount(MountType::EcryptfsToFscrypt, &user(), "aabb", "ccdd")
        .unwrap();

    let targets = fixture.mounted_targets();
    // The source is exposed at the temporary mount point only.
    assert!(targets.contains(&layout::user_temporary_mount_directory(&user())));
    assert!(!targets.contains(&PathBuf::from("/home/user/0123456789abcdef")));
    assert!(!targets.contains(&PathBuf::from("/home/chronos/user")));
}

#[test]
fn busy_mount_point_is_rejected() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    let mut mounter = fixture.mounter(false, false);

    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();

    // A second mount of the same user observes the active data mount.
    // (The data mount itself is virtual for Dircrypto, so emulate the
    // busy state with a bind onto the mount directory.)
    let mount = layout::user_mount_directory(&user());
    fixture
        .platform
        .bind(Path::new("/home/user"), &mount, RemountOption::NoRemount)
        .unwrap();

    let mut second = fixture.mounter(false, false);
    let err = second
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap_err();
    assert_eq!(err.kind(), MountError::MountPointBusy);

    // Silence the non-empty stack of the first mounter.
    mounter.unmount_all();
}

#[test]
fn legacy_home_is_bound_once() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    let mut mounter = fixture.mounter(true, false);
    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();

    // Second user: the legacy mount stays with the first user.
    let second_user = ObfuscatedUsername::from_sanitized("fedcba9876543210").unwrap();
    fixture
        .platform
        .create_directory(&layout::user_mount_directory(&second_user))
        .unwrap();
    let mut second = fixture.mounter(true, false);
    second
        .perform_mount(MountType::Dircrypto, &second_user, "fek2", "fnek2")
        .unwrap();

    let legacy_binds = fixture
        .platform
        .mounts()
        .iter()
        .filter(|(_, dst)| dst == Path::new(LEGACY_HOME_DIR))
        .count();
    assert_eq!(legacy_binds, 1);

    second.unmount_all();
    mounter.unmount_all();
}

#[test]
fn unmount_all_reverses_in_lifo_order_and_drains() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    fixture.add_daemon_store("shill");
    let mut mounter = fixture.mounter(true, false);

    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();
    assert!(mounter.mount_performed());

    mounter.unmount_all();
    assert!(!mounter.mount_performed());
    assert!(fixture.platform.mounts().is_empty());
}

#[test]
fn busy_unmount_falls_back_to_lazy() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    let mut mounter = fixture.mounter(false, false);

    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();

    fixture
        .platform
        .make_busy(Path::new("/home/user/0123456789abcdef"));
    mounter.unmount_all();
    assert!(fixture.platform.mounts().is_empty());
}

#[test]
fn skeleton_is_copied_only_on_first_mount() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    fixture.add_skeleton_file("welcome.txt", "hello");
    let mut mounter = fixture.mounter(false, false);

    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();
    let user_home = layout::user_mount_directory(&user()).join("user");
    assert!(fixture.platform.file_exists(&user_home.join("welcome.txt")));
    mounter.unmount_all();

    // The user writes a file; later mounts must not re-copy the skeleton.
    std::fs::write(
        fixture.platform.translate(&user_home.join("mydoc.txt")),
        "mine",
    )
    .unwrap();
    std::fs::remove_file(fixture.platform.translate(&user_home.join("welcome.txt"))).unwrap();

    let mut remounter = fixture.mounter(false, false);
    remounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();
    assert!(!fixture.platform.file_exists(&user_home.join("welcome.txt")));
    remounter.unmount_all();
}

#[test]
fn downloads_bind_mode_restores_stray_files() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    let mut mounter = fixture.mounter(false, true);

    let user_home = layout::user_mount_directory(&user()).join("user");
    fixture
        .platform
        .create_directory(&user_home.join("MyFiles/Downloads"))
        .unwrap();
    std::fs::write(
        fixture
            .platform
            .translate(&user_home.join("MyFiles/Downloads/stranded.txt")),
        "stranded",
    )
    .unwrap();

    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();

    // The stray file moved back into ~/Downloads before the bind.
    assert!(fixture
        .platform
        .file_exists(&user_home.join("Downloads/stranded.txt")));
    assert!(fixture
        .platform
        .mounts()
        .iter()
        .any(|(src, dst)| src == &user_home.join("Downloads")
            && dst == &user_home.join("MyFiles/Downloads")));
}

#[test]
fn downloads_migration_mode_converges() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    let user_home = layout::user_mount_directory(&user()).join("user");

    let mut mounter = fixture.mounter(false, false);
    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();

    // No Downloads bind is recorded, and the home is marked migrated.
    assert!(!fixture
        .platform
        .mounts()
        .iter()
        .any(|(_, dst)| dst == &user_home.join("MyFiles/Downloads")));
    assert_eq!(
        fixture
            .platform
            .get_xattr(
                &user_home.join("MyFiles/Downloads"),
                layout::BIND_MOUNT_MIGRATION_XATTR
            )
            .unwrap()
            .as_deref(),
        Some(b"migrated".as_slice())
    );
}

#[test]
fn ephemeral_mount_is_exclusive() {
    let fixture = Fixture::new();
    fixture.add_skeleton_file("welcome.txt", "hello");
    let mut mounter = fixture.mounter(false, false);

    mounter
        .perform_ephemeral_mount(&user(), Path::new("/dev/loop7"))
        .unwrap();

    let mount_point = layout::ephemeral_mount_directory(&user());
    assert_eq!(
        fixture.platform.selinux_context(&mount_point).as_deref(),
        Some("u:object_r:cros_home_shadow_uid:s0")
    );
    assert!(fixture
        .platform
        .file_exists(&mount_point.join("user/welcome.txt")));
    assert!(fixture
        .platform
        .mounts()
        .iter()
        .any(|(src, _)| src == Path::new("/dev/loop7")));

    // A second ephemeral mount is refused while anything is mounted.
    let err = mounter
        .perform_ephemeral_mount(&user(), Path::new("/dev/loop8"))
        .unwrap_err();
    assert_eq!(err.kind(), MountError::MountPointBusy);

    mounter.unmount_all();
    // The ephemeral mount point tree is cleaned on unmount.
    assert!(!fixture.platform.directory_exists(&mount_point));
}

#[test]
fn stale_user_mount_points_are_recreated() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();

    // Leftover content in a mount point from a crashed session.
    let stale = layout::user_multi_home(&user());
    fixture.platform.create_directory(&stale.join("junk")).unwrap();

    let mut mounter = fixture.mounter(false, false);
    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();

    assert!(!fixture.platform.directory_exists(&stale.join("junk")));
    let st = fixture.platform.stat(&stale).unwrap().unwrap();
    assert_eq!((st.uid, st.gid, st.permissions()), (1000, 1001, 0o750));
    mounter.unmount_all();
}

#[test]
fn daemon_store_source_inherits_template_acl() {
    let fixture = Fixture::new();
    fixture.prepare_fscrypt_home();
    fixture.add_daemon_store("shill");

    let mut mounter = fixture.mounter(false, false);
    mounter
        .perform_mount(MountType::Dircrypto, &user(), "fek", "fnek")
        .unwrap();

    let source = layout::user_mount_directory(&user()).join("root/shill");
    let st = fixture.platform.stat(&source).unwrap().unwrap();
    assert_eq!((st.uid, st.gid, st.permissions()), (42, 42, 0o770));
    mounter.unmount_all();
}
