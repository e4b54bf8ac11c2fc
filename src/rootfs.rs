//! Sandbox root filesystem assembly.
//!
//! The root is a tmpfs populated in a fixed order: scaffold, whitelist
//! binds, symlinks, blacklist masks, the xpra socket directory, chroot,
//! then the pseudo-filesystems. Build steps abort on the first error and
//! the in-flight mounts are unwound so the kernel is left clean even if
//! the process lingers.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, chown, chroot, Gid, Uid};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{InitError, Result};
use crate::handshake::SandboxUser;
use crate::paths::{self, XdgDirs};
use crate::profile::{BlacklistItem, Profile, WhitelistItem};

/// Minimal character devices created when the full /dev is not requested:
/// (name, major, minor).
const BASE_DEVICES: &[(&str, u64, u64)] = &[
    ("null", 1, 3),
    ("zero", 1, 5),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

/// Inputs for one filesystem build.
pub struct BuildInputs<'a> {
    pub profile: &'a Profile,
    pub extra_whitelist: Vec<WhitelistItem>,
    pub extra_blacklist: Vec<BlacklistItem>,
    pub ephemeral: bool,
    pub display: u32,
}

/// Assembles and owns the sandbox root until the chroot happens.
pub struct Filesystem {
    root: PathBuf,
    user: SandboxUser,
    xdg: XdgDirs,
    uid: u32,
    gid: u32,
    use_full_dev: bool,
    etc_includes: Vec<String>,
    chrooted: bool,
    /// Mount targets in mount order, for error unwinding.
    mounts: Vec<PathBuf>,
}

impl Filesystem {
    pub fn new(config: &Config, user: &SandboxUser, uid: u32, gid: u32, profile_name: &str) -> Self {
        let xdg = XdgDirs::for_user(user);
        Filesystem {
            root: config.sandbox_path.join("rootfs").join(profile_name),
            user: user.clone(),
            xdg,
            uid,
            gid,
            use_full_dev: config.use_full_dev,
            etc_includes: config.etc_includes.clone(),
            chrooted: false,
            mounts: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn xdg(&self) -> &XdgDirs {
        &self.xdg
    }

    /// Execute the whole build order. On error the in-flight mounts are
    /// unwound before returning.
    pub fn build(&mut self, inputs: &BuildInputs<'_>) -> Result<()> {
        if self.chrooted {
            return Err(InitError::Rootfs(
                "filesystem already built and chrooted".to_string(),
            ));
        }
        let result = self.build_inner(inputs);
        if result.is_err() {
            self.unwind();
        }
        result
    }

    fn build_inner(&mut self, inputs: &BuildInputs<'_>) -> Result<()> {
        self.scaffold()?;

        let whitelist = effective_whitelist(
            inputs.profile,
            &inputs.extra_whitelist,
            inputs.ephemeral,
            &self.user,
            &self.xdg,
        );
        for item in &whitelist {
            self.bind_item(item)?;
        }
        self.create_symlinks(&whitelist)?;

        for item in inputs
            .extra_blacklist
            .iter()
            .chain(inputs.profile.blacklist.iter())
        {
            self.blacklist_item(item)?;
        }

        if inputs.profile.xserver.enabled {
            self.bind_xpra_dir(&inputs.profile.name)?;
        }

        self.chroot_into()?;
        self.mount_pseudo(inputs.profile.no_sys_proc)
    }

    /// Step 1: tmpfs root with /etc, /dev, /proc, /sys mount points and the
    /// user's home skeleton.
    fn scaffold(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        // Keep every mount below out of the parent namespace.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| InitError::Mount {
            path: PathBuf::from("/"),
            source: e,
        })?;

        self.mount_at(
            Some("tmpfs"),
            self.root.clone(),
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=755"),
        )?;

        for dir in ["etc", "dev", "proc", "sys", "run", "var"] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        let tmp = self.root.join("tmp");
        fs::create_dir_all(&tmp)?;
        fs::set_permissions(&tmp, std::os::unix::fs::PermissionsExt::from_mode(0o1777))?;

        if self.use_full_dev {
            // devtmpfs arrives after the chroot.
        } else {
            self.populate_dev()?;
        }

        for name in &self.etc_includes {
            let source = Path::new("/etc").join(name);
            let dest = self.root.join("etc").join(name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Err(e) = fs::copy(&source, &dest) {
                warn!("Failed to copy /etc/{} into sandbox: {}", name, e);
            }
        }

        let home = self.path_in_root(&self.user.home_dir)?;
        fs::create_dir_all(&home)?;
        self.chown_to_user(&home)?;
        debug!("Created sandbox root at {}", self.root.display());
        Ok(())
    }

    /// Minimal /dev: a few character devices, the std fd symlinks, and the
    /// pts/shm mount points.
    fn populate_dev(&self) -> Result<()> {
        let dev = self.root.join("dev");
        for (name, major, minor) in BASE_DEVICES {
            mknod(
                &dev.join(name),
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o666),
                makedev(*major, *minor),
            )?;
        }
        symlink("/proc/self/fd", dev.join("fd"))?;
        symlink("fd/0", dev.join("stdin"))?;
        symlink("fd/1", dev.join("stdout"))?;
        symlink("fd/2", dev.join("stderr"))?;
        symlink("pts/ptmx", dev.join("ptmx"))?;
        fs::create_dir_all(dev.join("pts"))?;
        let shm = dev.join("shm");
        fs::create_dir_all(&shm)?;
        fs::set_permissions(&shm, std::os::unix::fs::PermissionsExt::from_mode(0o1777))?;
        Ok(())
    }

    /// Step 4: bind one whitelist item, expanding a glob in its source.
    fn bind_item(&mut self, item: &WhitelistItem) -> Result<()> {
        if item.path.is_empty() {
            return Ok(());
        }
        let mut sources = paths::resolve_glob(&item.path, &self.user, &self.xdg)?;
        if sources.is_empty() {
            // No glob match: fall back to the literal path so ignore and
            // can_create semantics apply to it.
            sources.push(paths::resolve_no_glob(&item.path, &self.user, &self.xdg)?);
        }
        let globbed = sources.len() > 1;
        for source in &sources {
            self.bind_one(source, item, globbed)?;
        }
        Ok(())
    }

    fn bind_one(&mut self, source: &Path, item: &WhitelistItem, globbed: bool) -> Result<()> {
        // symlink_metadata sees the link itself; metadata resolves it, so a
        // dangling symlink counts as a missing source.
        let resolved = match fs::symlink_metadata(source) {
            Ok(meta) => {
                if item.no_follow && meta.file_type().is_symlink() {
                    return Err(InitError::SymlinkRefused(source.to_path_buf()));
                }
                fs::metadata(source).ok()
            }
            Err(_) => None,
        };
        let resolved = match resolved {
            Some(meta) => Some(meta),
            None if item.ignore => {
                debug!("Skipping whitelist item, missing source: {}", source.display());
                return Ok(());
            }
            None if item.can_create => {
                self.create_dir_tree_owned(source)?;
                None
            }
            None => return Err(InitError::SourceNotFound(source.to_path_buf())),
        };
        let source_is_dir = resolved.map(|m| m.is_dir()).unwrap_or(true);

        let target = if item.target.is_empty() {
            source.to_path_buf()
        } else {
            let explicit = paths::resolve_no_glob(&item.target, &self.user, &self.xdg)?;
            if globbed {
                // Several glob matches share one target directory.
                explicit.join(source.file_name().unwrap_or_default())
            } else {
                explicit
            }
        };
        let target = self.path_in_root(&target)?;

        if item.force {
            if let Ok(existing) = fs::symlink_metadata(&target) {
                if !existing.is_dir() {
                    fs::remove_file(&target)?;
                }
            }
        }

        if let Some(parent) = target.parent() {
            if item.can_create {
                self.create_dir_tree_owned(parent)?;
            } else {
                fs::create_dir_all(parent)?;
            }
        }
        if source_is_dir {
            fs::create_dir_all(&target)?;
        } else if fs::symlink_metadata(&target).is_err() {
            fs::File::create(&target)?;
        }

        debug!(
            "Bind mounting {} -> {}",
            source.display(),
            target.display()
        );
        self.mount_at(Some(source), target.clone(), None, MsFlags::MS_BIND, None)?;
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            bind_remount_flags(item),
            None::<&str>,
        )
        .map_err(|e| InitError::Mount {
            path: target,
            source: e,
        })?;
        Ok(())
    }

    /// Step 5: symlinks requested by whitelist items.
    fn create_symlinks(&self, items: &[WhitelistItem]) -> Result<()> {
        for item in items {
            if item.symlink.is_empty() || item.path.is_empty() {
                continue;
            }
            let link = paths::resolve_no_glob(&item.symlink, &self.user, &self.xdg)?;
            let dest = if item.target.is_empty() {
                paths::resolve_no_glob(&item.path, &self.user, &self.xdg)?
            } else {
                paths::resolve_no_glob(&item.target, &self.user, &self.xdg)?
            };
            let link_in_root = self.path_in_root(&link)?;
            if fs::symlink_metadata(&link_in_root).is_ok() {
                continue;
            }
            if let Some(parent) = link_in_root.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!(
                "Creating symlink {} -> {}",
                link_in_root.display(),
                dest.display()
            );
            symlink(&dest, &link_in_root)?;
            if let Err(e) = lchown(&link_in_root, self.uid, self.gid) {
                warn!("Failed to chown symbolic link: {}", e);
            }
        }
        Ok(())
    }

    /// Step 6: mask one blacklist path with an inaccessible bind.
    fn blacklist_item(&mut self, item: &BlacklistItem) -> Result<()> {
        if item.path.is_empty() {
            return Ok(());
        }
        for target in paths::resolve_glob(&item.path, &self.user, &self.xdg)? {
            let inside = self.path_in_root(&target)?;
            let meta = match fs::symlink_metadata(&inside) {
                Ok(meta) => meta,
                // Nothing bound there, nothing to mask.
                Err(_) => continue,
            };
            let mask = if meta.is_dir() {
                self.mask_source(true)?
            } else {
                self.mask_source(false)?
            };
            debug!("Masking blacklisted path {}", target.display());
            self.mount_at(Some(&mask), inside, None, MsFlags::MS_BIND, None)?;
        }
        Ok(())
    }

    /// Root-owned mode-0 node used as a bind source for masking.
    fn mask_source(&self, dir: bool) -> Result<PathBuf> {
        let path = if dir {
            self.root.join("run/.masked.d")
        } else {
            self.root.join("run/.masked")
        };
        if fs::symlink_metadata(&path).is_err() {
            if dir {
                fs::create_dir(&path)?;
            } else {
                fs::File::create(&path)?;
            }
            fs::set_permissions(&path, std::os::unix::fs::PermissionsExt::from_mode(0))?;
        }
        Ok(path)
    }

    /// Step 7: share the xpra work directory with the host through
    /// /tmp/.X11-unix so the X socket appears on both sides.
    fn bind_xpra_dir(&mut self, profile_name: &str) -> Result<PathBuf> {
        let workdir = self.user.home_dir.join(".Xoz").join(profile_name);
        fs::create_dir_all(&workdir)?;
        fs::set_permissions(
            &workdir,
            std::os::unix::fs::PermissionsExt::from_mode(0o700),
        )?;
        self.chown_to_user(&workdir)?;

        let target = self.root.join("tmp/.X11-unix");
        fs::create_dir_all(&target)?;
        self.mount_at(Some(&workdir), target.clone(), None, MsFlags::MS_BIND, None)?;
        Ok(workdir)
    }

    /// Step 8.
    fn chroot_into(&mut self) -> Result<()> {
        info!("Chrooting into {}", self.root.display());
        chdir(&self.root)?;
        chroot(".")?;
        chdir("/")?;
        self.chrooted = true;
        // Rewrite the unwind list into in-root paths.
        let root = self.root.clone();
        for target in &mut self.mounts {
            if let Ok(rel) = target.strip_prefix(&root) {
                *target = Path::new("/").join(rel);
            }
        }
        Ok(())
    }

    /// Step 9: pseudo-filesystems, devpts before anything that may need a
    /// PTY.
    fn mount_pseudo(&mut self, no_sys_proc: bool) -> Result<()> {
        if self.use_full_dev {
            self.mount_at(
                Some("devtmpfs"),
                PathBuf::from("/dev"),
                Some("devtmpfs"),
                MsFlags::MS_NOSUID,
                Some("mode=755"),
            )?;
            self.mount_at(
                Some("tmpfs"),
                PathBuf::from("/dev/shm"),
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some("mode=1777"),
            )?;
        }
        fs::create_dir_all("/dev/pts")?;
        self.mount_at(
            Some("devpts"),
            PathBuf::from("/dev/pts"),
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("newinstance,ptmxmode=0666,mode=0620"),
        )?;
        if !no_sys_proc {
            self.mount_at(
                Some("proc"),
                PathBuf::from("/proc"),
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                None,
            )?;
            self.mount_at(
                Some("sysfs"),
                PathBuf::from("/sys"),
                Some("sysfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                None,
            )?;
        }
        Ok(())
    }

    fn mount_at<S: AsRef<Path> + ?Sized>(
        &mut self,
        source: Option<&S>,
        target: PathBuf,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source.map(|s| s.as_ref()), &target, fstype, flags, data).map_err(|e| {
            InitError::Mount {
                path: target.clone(),
                source: e,
            }
        })?;
        self.mounts.push(target);
        Ok(())
    }

    /// Detach every recorded mount in reverse order, then the tmpfs root.
    pub fn unwind(&mut self) {
        for target in self.mounts.drain(..).rev() {
            if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
                warn!("Failed to unmount {}: {}", target.display(), e);
            }
        }
        if !self.chrooted {
            let _ = umount2(&self.root, MntFlags::MNT_DETACH);
        }
    }

    /// Translate an absolute sandbox path to its pre-chroot location.
    /// Rejects `..` components: no bind may cross out of the new root.
    fn path_in_root(&self, path: &Path) -> Result<PathBuf> {
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(InitError::Rootfs(format!(
                "path escapes sandbox root: {}",
                path.display()
            )));
        }
        let rel = path.strip_prefix("/").unwrap_or(path);
        Ok(self.root.join(rel))
    }

    /// mkdir -p with every newly created directory owned by the sandbox
    /// user.
    fn create_dir_tree_owned(&self, path: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut probe = path.to_path_buf();
        while fs::symlink_metadata(&probe).is_err() {
            missing.push(probe.clone());
            match probe.parent() {
                Some(parent) => probe = parent.to_path_buf(),
                None => break,
            }
        }
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir)?;
            fs::set_permissions(&dir, std::os::unix::fs::PermissionsExt::from_mode(0o755))?;
            self.chown_to_user(&dir)?;
        }
        Ok(())
    }

    fn chown_to_user(&self, path: &Path) -> Result<()> {
        chown(
            path,
            Some(Uid::from_raw(self.uid)),
            Some(Gid::from_raw(self.gid)),
        )?;
        Ok(())
    }
}

/// Remount flags for a whitelist bind. nosuid and nodev are always applied
/// unless the item explicitly allows setuid, which in turn forces the mount
/// read-only.
fn bind_remount_flags(item: &WhitelistItem) -> MsFlags {
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NODEV;
    if item.allow_setuid {
        flags |= MsFlags::MS_RDONLY;
    } else {
        flags |= MsFlags::MS_NOSUID;
    }
    if item.read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    flags
}

/// Change ownership of a symlink itself.
fn lchown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: lchown only reads the path string and never follows the final
    // symlink; c_path is a valid NUL-terminated string.
    let ret = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Steps 2–4 input assembly: ephemeral filtering, shared-folder lowering,
/// and ordering (extras before the profile's own whitelist).
///
/// The ephemeral filter applies to the profile's whitelist and shared
/// folders only; extra items are init-supplied session plumbing (pulse
/// sockets and the like) and are bound unconditionally.
pub fn effective_whitelist(
    profile: &Profile,
    extras: &[WhitelistItem],
    ephemeral: bool,
    user: &SandboxUser,
    xdg: &XdgDirs,
) -> Vec<WhitelistItem> {
    let mut out: Vec<WhitelistItem> = extras.to_vec();

    let shared: Vec<&String> = profile
        .shared_folders
        .iter()
        .filter(|sf| !(ephemeral && (sf.starts_with("${HOME}") || sf.starts_with("${XDG_"))))
        .collect();
    for folder in shared {
        match shared_folder_item(&profile.name, folder, user, xdg) {
            Some(item) => out.push(item),
            None => warn!("Failed to resolve path for symlink: {}", folder),
        }
    }

    out.extend(
        profile
            .whitelist
            .iter()
            .filter(|item| !(ephemeral && item.is_ephemeral()))
            .cloned(),
    );
    out
}

/// Lower one shared folder to a whitelist item binding
/// `${HOME}/OZ/<Title>/<flat>` at `${HOME}/.shared/<flat>` with a symlink
/// at the folder's original location.
fn shared_folder_item(
    profile_name: &str,
    folder: &str,
    user: &SandboxUser,
    xdg: &XdgDirs,
) -> Option<WhitelistItem> {
    let resolved = paths::resolve_no_glob(folder, user, xdg).ok()?;
    let home = user.home_dir.to_string_lossy();
    let resolved = resolved.to_string_lossy().into_owned();
    let rel = resolved
        .strip_prefix(home.as_ref())
        .unwrap_or(&resolved)
        .to_string();
    let flat = flat_name(&rel);
    Some(WhitelistItem {
        path: format!("${{HOME}}/OZ/{}/{}", title_case(profile_name), flat),
        target: format!("${{HOME}}/.shared/{flat}"),
        symlink: format!("${{HOME}}{rel}"),
        can_create: true,
        ..Default::default()
    })
}

/// `/Documents/work` → `Documents-work`.
fn flat_name(rel: &str) -> String {
    let flat = rel.replace('/', "-");
    flat.strip_prefix('-').map(str::to_string).unwrap_or(flat)
}

fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Post-chroot bind of a path into the running sandbox (MountFiles). The
/// path is re-bound over itself so the read-only flag can be applied.
pub fn mount_file(path: &Path, read_only: bool) -> Result<()> {
    mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| InitError::Mount {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    mount(None::<&str>, path, None::<&str>, flags, None::<&str>).map_err(|e| InitError::Mount {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Reverse of [`mount_file`].
pub fn unmount_file(path: &Path) -> Result<()> {
    umount2(path, MntFlags::MNT_DETACH).map_err(|e| InitError::Mount {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> SandboxUser {
        SandboxUser {
            uid: 1000,
            gid: 1000,
            name: "user".into(),
            home_dir: PathBuf::from("/home/user"),
        }
    }

    fn xdg() -> XdgDirs {
        XdgDirs::for_user(&user())
    }

    fn item(path: &str) -> WhitelistItem {
        WhitelistItem {
            path: path.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ephemeral_filter_strips_home_items() {
        let profile = Profile {
            whitelist: vec![
                WhitelistItem {
                    path: "${HOME}/.config/x".into(),
                    read_only: true,
                    ..Default::default()
                },
                item("/etc/ssl/certs"),
            ],
            ..Default::default()
        };
        let effective = effective_whitelist(&profile, &[], true, &user(), &xdg());
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].path, "/etc/ssl/certs");
    }

    #[test]
    fn test_ephemeral_false_keeps_everything() {
        let profile = Profile {
            whitelist: vec![item("${HOME}/.config/x"), item("/etc/ssl/certs")],
            ..Default::default()
        };
        let effective = effective_whitelist(&profile, &[], false, &user(), &xdg());
        assert_eq!(effective.len(), 2);
    }

    #[test]
    fn test_extras_precede_profile_whitelist() {
        let profile = Profile {
            whitelist: vec![item("/usr/share/app")],
            ..Default::default()
        };
        let extras = vec![item("/run/user/${UID}/pulse/native")];
        let effective = effective_whitelist(&profile, &extras, false, &user(), &xdg());
        assert_eq!(effective[0].path, "/run/user/${UID}/pulse/native");
        assert_eq!(effective[1].path, "/usr/share/app");
    }

    #[test]
    fn test_shared_folder_lowering() {
        let profile = Profile {
            name: "editor".into(),
            shared_folders: vec!["${HOME}/Documents/work".into()],
            ..Default::default()
        };
        let effective = effective_whitelist(&profile, &[], false, &user(), &xdg());
        assert_eq!(effective.len(), 1);
        let lowered = &effective[0];
        assert_eq!(lowered.path, "${HOME}/OZ/Editor/Documents-work");
        assert_eq!(lowered.target, "${HOME}/.shared/Documents-work");
        assert_eq!(lowered.symlink, "${HOME}/Documents/work");
        assert!(lowered.can_create);
    }

    #[test]
    fn test_shared_folders_respect_ephemeral() {
        let profile = Profile {
            name: "editor".into(),
            shared_folders: vec!["${HOME}/Documents".into()],
            ..Default::default()
        };
        let effective = effective_whitelist(&profile, &[], true, &user(), &xdg());
        assert!(effective.is_empty());
    }

    #[test]
    fn test_extras_survive_ephemeral_filter() {
        // Session plumbing like the pulse cookie lives under ${HOME} but is
        // bound even in throwaway sandboxes.
        let extras = vec![WhitelistItem {
            path: "${HOME}/.config/pulse/cookie".into(),
            ignore: true,
            read_only: true,
            ..Default::default()
        }];
        let profile = Profile {
            whitelist: vec![item("${HOME}/.config/x")],
            ..Default::default()
        };
        let effective = effective_whitelist(&profile, &extras, true, &user(), &xdg());
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].path, "${HOME}/.config/pulse/cookie");
    }

    #[test]
    fn test_flat_name() {
        assert_eq!(flat_name("/Documents/work"), "Documents-work");
        assert_eq!(flat_name("Documents"), "Documents");
    }

    #[test]
    fn test_allow_setuid_implies_read_only_mount() {
        let setuid = WhitelistItem {
            allow_setuid: true,
            ..Default::default()
        };
        let flags = bind_remount_flags(&setuid);
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(!flags.contains(MsFlags::MS_NOSUID));

        let plain = WhitelistItem::default();
        let flags = bind_remount_flags(&plain);
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(!flags.contains(MsFlags::MS_RDONLY));

        let ro = WhitelistItem {
            read_only: true,
            ..Default::default()
        };
        assert!(bind_remount_flags(&ro).contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("editor"), "Editor");
        assert_eq!(title_case(""), "");
    }
}
