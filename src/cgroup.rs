//! Cgroup preparation and installation for the omegajail layout.
//!
//! The supervisor prepares the per-script parent directory while it still
//! runs outside the container; the init creates a uniquely named scoped
//! cgroup under it, writes the limits, and locks the limit files read-only.
//! On cgroup v2 a single unified subtree carries the memory limit; on v1 a
//! pids cgroup tracks the run and a separate memory cgroup under a fixed
//! parent enforces the limit.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::AccessFlags;

use crate::scoped::ScopedCgroup;
use crate::types::{JailError, Result};

const V2_BASE: &str = "/sys/fs/cgroup/omegajail";
const V1_PIDS_BASE: &str = "/sys/fs/cgroup/pids/omegajail";
const V1_MEMORY_BASE: &str = "/sys/fs/cgroup/memory/omegajail";

pub fn is_cgroup_v2() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

/// What the supervisor worked out before entering the namespaces.
#[derive(Debug, Default)]
pub struct CgroupPlan {
    /// Parent directory for the scoped per-run cgroup, when usable.
    pub cgroup_path: Option<PathBuf>,
    /// Directories the init must bind-mount into the container.
    pub binds: Vec<PathBuf>,
}

/// Resolves the cgroup layout for this run. A missing or unwritable layout
/// degrades to no cgroup accounting rather than failing the run.
pub fn prepare(
    script_basename: Option<&str>,
    memory_limit_bytes: i64,
    sandboxed: bool,
) -> Result<CgroupPlan> {
    let mut plan = CgroupPlan::default();
    let v2 = is_cgroup_v2();

    if let Some(basename) = script_basename {
        if v2 {
            if nix::unistd::access(V2_BASE, AccessFlags::W_OK).is_ok() {
                let path = Path::new(V2_BASE).join(basename);
                match nix::unistd::mkdir(
                    &path,
                    nix::sys::stat::Mode::from_bits_truncate(0o775),
                ) {
                    Ok(()) => {
                        write_cgroup_file(&path.join("cgroup.subtree_control"), "+memory", false)?;
                    }
                    Err(nix::errno::Errno::EEXIST) => {}
                    Err(err) => {
                        return Err(JailError::Cgroup(format!(
                            "failed to create {}: {}",
                            path.display(),
                            err
                        )));
                    }
                }
                plan.cgroup_path = Some(path);
                if sandboxed {
                    plan.binds.push(PathBuf::from(V2_BASE));
                }
            }
        } else {
            let path = Path::new(V1_PIDS_BASE).join(basename);
            if nix::unistd::access(&path, AccessFlags::W_OK).is_ok() {
                plan.cgroup_path = Some(path);
                if sandboxed {
                    plan.binds.push(PathBuf::from(V1_PIDS_BASE));
                }
            }
        }
    }

    if memory_limit_bytes >= 0 && !v2 && sandboxed {
        plan.binds.push(PathBuf::from(V1_MEMORY_BASE));
    }

    Ok(plan)
}

/// The scoped cgroups owned by the container init.
///
/// The child joins them and releases its copies so they outlive the fork;
/// the init keeps its own handles so it can read `memory.failcnt` after the
/// reap and remove the directories on drop.
#[derive(Debug, Default)]
pub struct CgroupSet {
    unified: Option<ScopedCgroup>,
    pids: Option<ScopedCgroup>,
    memory: Option<ScopedCgroup>,
}

/// Creates the scoped cgroups and writes the memory limit.
pub fn install(
    cgroup_path: Option<&Path>,
    memory_limit_bytes: i64,
    enforce_memory: bool,
) -> Result<CgroupSet> {
    install_at(
        is_cgroup_v2(),
        cgroup_path,
        Path::new(V1_MEMORY_BASE),
        memory_limit_bytes,
        enforce_memory,
    )
}

fn install_at(
    v2: bool,
    cgroup_path: Option<&Path>,
    v1_memory_base: &Path,
    memory_limit_bytes: i64,
    enforce_memory: bool,
) -> Result<CgroupSet> {
    let mut set = CgroupSet::default();

    if let Some(parent) = cgroup_path {
        if v2 {
            set.unified = Some(ScopedCgroup::create(parent)?);
        } else {
            set.pids = Some(ScopedCgroup::create(parent)?);
        }
    }

    if enforce_memory && memory_limit_bytes >= 0 {
        let limit_path = if let Some(unified) = &set.unified {
            unified.path().expect("freshly created").join("memory.max")
        } else {
            let memory = ScopedCgroup::create(v1_memory_base)?;
            let path = memory
                .path()
                .expect("freshly created")
                .join("memory.limit_in_bytes");
            set.memory = Some(memory);
            path
        };
        write_cgroup_file(&limit_path, &memory_limit_bytes.to_string(), false)?;
        lock_read_only(&limit_path)?;
    }

    Ok(set)
}

impl CgroupSet {
    /// Joins the calling process to every cgroup, then releases the handles
    /// and locks the membership files. Run in the child after the fork, so
    /// the init's own copies stay owned.
    ///
    /// The child is always task 2 inside the PID namespace (the init is 1).
    pub fn join_child_task(&mut self) -> Result<()> {
        if let Some(unified) = &mut self.unified {
            let procs_path = unified.path().expect("not yet released").join("cgroup.procs");
            write_cgroup_file(&procs_path, "+2\n", true)?;
            unified.release();
            lock_read_only(&procs_path)?;
            return Ok(());
        }
        for cgroup in [&mut self.memory, &mut self.pids].into_iter().flatten() {
            let tasks_path = cgroup.path().expect("not yet released").join("tasks");
            write_cgroup_file(&tasks_path, "2\n", true)?;
            cgroup.release();
            lock_read_only(&tasks_path)?;
        }
        Ok(())
    }

    /// Number of times the v1 memory cgroup hit its limit, when one exists.
    pub fn memory_failcnt(&self) -> Option<u64> {
        let path = self.memory.as_ref()?.path()?.join("memory.failcnt");
        let contents = fs::read_to_string(&path)
            .map_err(|err| log::error!("failed to read {}: {}", path.display(), err))
            .ok()?;
        contents.trim().parse().ok()
    }

    pub fn has_memory_cgroup(&self) -> bool {
        self.memory.is_some()
    }
}

fn write_cgroup_file(path: &Path, contents: &str, append: bool) -> Result<()> {
    log::debug!("writing {:?} to {}", contents, path.display());
    let result = if append {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, contents.as_bytes()))
    } else {
        fs::write(path, contents)
    };
    result.map_err(|err| {
        JailError::Cgroup(format!("failed to write {}: {}", path.display(), err))
    })
}

fn lock_read_only(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o444)).map_err(|err| {
        JailError::Cgroup(format!("failed to lock {}: {}", path.display(), err))
    })
}
