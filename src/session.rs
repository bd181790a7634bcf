//! Isolator session
//!
//! Drives one compile-or-execute pass inside a box: builds the isolator argv
//! from a user-supplied [`OptionSet`], runs it via [`crate::process::communicate`],
//! and parses the result through [`crate::meta::parse_meta`]. Grounded on the
//! teacher's `IsolateBox::run`/`compile` (argv assembly, meta/stdout read-back,
//! temp meta file) in `sandbox::isolate_box` and `sandbox.rs`, generalized from
//! hardcoded flags (`--processes=64`, fixed `--dir=...` mounts, a fixed JVM
//! env var) to the spec's fully data-driven `OptionSet` and `allowed_dirs`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::fs;

use crate::config::get_config;
use crate::error::IsolateError;
use crate::meta::{parse_meta, MetaRecord};
use crate::process::communicate;
use crate::BoxId;

/// User-supplied resource limits and policy toggles (§3 OptionSet). Every
/// field is optional; an absent field means "don't pass a flag for this",
/// except `processes`, whose absence means "pass the unlimited-processes
/// flag" (inverting isolate's own restrictive default).
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    pub time: Option<f64>,
    pub wall_time: Option<f64>,
    pub extra_time: Option<f64>,
    pub mem: Option<u64>,
    pub virt_mem: Option<u64>,
    pub stack: Option<u64>,
    pub fsize: Option<u64>,
    pub processes: Option<u32>,
    pub quota: Option<u64>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time(mut self, seconds: f64) -> Self {
        self.time = Some(seconds);
        self
    }

    pub fn wall_time(mut self, seconds: f64) -> Self {
        self.wall_time = Some(seconds);
        self
    }

    pub fn extra_time(mut self, seconds: f64) -> Self {
        self.extra_time = Some(seconds);
        self
    }

    pub fn mem(mut self, kb: u64) -> Self {
        self.mem = Some(kb);
        self
    }

    pub fn virt_mem(mut self, kb: u64) -> Self {
        self.virt_mem = Some(kb);
        self
    }

    pub fn stack(mut self, kb: u64) -> Self {
        self.stack = Some(kb);
        self
    }

    pub fn fsize(mut self, kb: u64) -> Self {
        self.fsize = Some(kb);
        self
    }

    pub fn processes(mut self, n: u32) -> Self {
        self.processes = Some(n);
        self
    }

    pub fn quota(mut self, kb: u64) -> Self {
        self.quota = Some(kb);
        self
    }

    /// Emits the isolator flags this option set implies, per the key map in
    /// §4.5 (`mem` -> `--cg-mem`, `virt_mem` -> `--mem`, everything else
    /// verbatim with `_` -> `-`). `processes` omitted emits `--processes=0`
    /// (isolate's own "0 means unlimited" spelling).
    fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();

        if let Some(v) = self.time {
            flags.push(format!("--time={v}"));
        }
        if let Some(v) = self.wall_time {
            flags.push(format!("--wall-time={v}"));
        }
        if let Some(v) = self.extra_time {
            flags.push(format!("--extra-time={v}"));
        }
        if let Some(v) = self.mem {
            flags.push(format!("--cg-mem={v}"));
        }
        if let Some(v) = self.virt_mem {
            flags.push(format!("--mem={v}"));
        }
        if let Some(v) = self.stack {
            flags.push(format!("--stack={v}"));
        }
        if let Some(v) = self.fsize {
            flags.push(format!("--fsize={v}"));
        }
        if let Some(v) = self.quota {
            flags.push(format!("--quota={v}"));
        }
        match self.processes {
            Some(n) => flags.push(format!("--processes={n}")),
            None => flags.push("--processes=0".to_string()),
        }

        flags
    }
}

/// `{stdout, stderr, exitcode, meta}` — the outcome of one [`IsolatorSession::run`].
#[derive(Debug)]
pub struct ResultRecord {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub meta: MetaRecord,
}

/// Host environment variables forwarded into every box verbatim when present
/// (§4.5 environment pass-through).
const FORWARDED_ENV_VARS: &[&str] = &["PATH", "LD_LIBRARY_PATH", "LANG"];

/// What differs between explicit and auto-allocation mode: how the session
/// obtains its working directory on entry, and what it does (if anything) to
/// the box on exit. Grounded on the teacher's `Runner` trait
/// (`runner::sandboxed`/`runner::trusted`), which splits "how a program gets
/// executed" the same way this splits "how a box gets provisioned" —
/// `async_trait` because both operations need to run isolator subprocesses.
#[async_trait]
trait BoxProvisioner: Send {
    /// Resolves the working directory for `box_id`, updating it in place
    /// for auto-allocation (which doesn't know its box id until it finds one).
    async fn provision(&self, box_id: &mut BoxId) -> Result<PathBuf, IsolateError>;

    /// Runs on session exit, after meta has already been parsed.
    async fn teardown(&self, box_id: BoxId) -> Result<(), IsolateError>;
}

/// Bound to a box already acquired (and owned) by a `BoxLease`. Does not
/// init or terminally clean up — that belongs to the acquisition scope.
struct ExplicitProvisioner;

#[async_trait]
impl BoxProvisioner for ExplicitProvisioner {
    async fn provision(&self, box_id: &mut BoxId) -> Result<PathBuf, IsolateError> {
        Ok(get_config().work_dir(*box_id))
    }

    async fn teardown(&self, _box_id: BoxId) -> Result<(), IsolateError> {
        Ok(())
    }
}

/// Legacy: allocates its own free box on `enter()`, cleans it up on
/// `exit()`, and propagates cleanup failures (unlike explicit mode).
struct AutoAllocateProvisioner;

#[async_trait]
impl BoxProvisioner for AutoAllocateProvisioner {
    async fn provision(&self, box_id: &mut BoxId) -> Result<PathBuf, IsolateError> {
        let (allocated, path) = auto_allocate_box().await?;
        *box_id = allocated;
        Ok(path)
    }

    async fn teardown(&self, box_id: BoxId) -> Result<(), IsolateError> {
        let output = communicate(
            &[
                "--box-id".to_string(),
                box_id.to_string(),
                "--cg".to_string(),
                "--cleanup".to_string(),
            ],
            b"",
        )
        .await?;
        if output.exit_code != 0 {
            return Err(IsolateError::CleanupFailure {
                box_id,
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

enum State {
    Constructed,
    Entered {
        meta_file: NamedTempFile,
        work_dir: PathBuf,
    },
    Exited,
}

/// One compile-or-execute pass bound to a box. `Constructed -> Entered ->
/// (Ran)* -> Exited`; a session is single-use per box acquisition — a
/// request with a compile phase and N tests constructs N+1 sessions against
/// the same `box_id`.
pub struct IsolatorSession {
    box_id: BoxId,
    options: OptionSet,
    allowed_dirs: Vec<PathBuf>,
    mode: Box<dyn BoxProvisioner>,
    state: State,
}

impl IsolatorSession {
    /// Explicit mode: `box_id` must come from an active `BoxLease`.
    pub fn for_box(box_id: BoxId, options: OptionSet) -> Self {
        Self {
            box_id,
            options,
            allowed_dirs: Vec::new(),
            mode: Box::new(ExplicitProvisioner),
            state: State::Constructed,
        }
    }

    /// Legacy auto-allocation mode: `enter()` will scan `box_root` for a
    /// free slot instead of taking one from the caller.
    pub fn auto_allocate(options: OptionSet) -> Self {
        Self {
            box_id: BoxId(0), // placeholder; replaced by enter()
            options,
            allowed_dirs: Vec::new(),
            mode: Box::new(AutoAllocateProvisioner),
            state: State::Constructed,
        }
    }

    pub fn with_allowed_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.allowed_dirs = dirs.into_iter().collect();
        self
    }

    pub fn box_id(&self) -> BoxId {
        self.box_id
    }

    /// Opens the session: for explicit mode, just opens a temp meta file.
    /// For auto-allocation, also finds and `--init`s a free box.
    pub async fn enter(&mut self) -> Result<(), IsolateError> {
        if !matches!(self.state, State::Constructed) {
            return Err(IsolateError::IsolatorInternal {
                command: "enter".to_string(),
                stdout: String::new(),
                stderr: "session already entered".to_string(),
            });
        }

        let work_dir = self.mode.provision(&mut self.box_id).await?;

        let meta_file = NamedTempFile::new()?;
        self.state = State::Entered {
            meta_file,
            work_dir,
        };
        Ok(())
    }

    /// Runs one program inside the box under this session's `OptionSet`.
    /// May be called multiple times (e.g. a compile followed by re-using the
    /// same box for a run) as long as each call uses a distinct meta read —
    /// in practice most callers construct one session per phase instead.
    pub async fn run(
        &mut self,
        cmdline: &[String],
        stdin: &[u8],
        env: &[(String, String)],
        merge_outputs: bool,
    ) -> Result<ResultRecord, IsolateError> {
        let (meta_path, work_dir) = match &self.state {
            State::Entered {
                meta_file,
                work_dir,
            } => (meta_file.path().to_path_buf(), work_dir.clone()),
            _ => {
                return Err(IsolateError::IsolatorInternal {
                    command: "run".to_string(),
                    stdout: String::new(),
                    stderr: "session not entered".to_string(),
                })
            }
        };

        let argv = self.build_argv(&meta_path, cmdline, env, merge_outputs);
        let command_str = argv.join(" ");

        let output = communicate(&argv, stdin).await?;

        if output.exit_code >= 2 {
            return Err(IsolateError::IsolatorInternal {
                command: command_str,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout_path = work_dir.join("._stdout");
        let stdout = fs::read(&stdout_path).await.map_err(|e| {
            IsolateError::IsolatorInternal {
                command: command_str.clone(),
                stdout: String::new(),
                stderr: format!("reading {stdout_path:?}: {e}"),
            }
        })?;

        let stderr = if merge_outputs {
            Vec::new()
        } else {
            let stderr_path = work_dir.join("._stderr");
            fs::read(&stderr_path).await.map_err(|e| {
                IsolateError::IsolatorInternal {
                    command: command_str.clone(),
                    stdout: String::new(),
                    stderr: format!("reading {stderr_path:?}: {e}"),
                }
            })?
        };

        let meta_content = fs::read_to_string(&meta_path).await.unwrap_or_default();
        let meta = parse_meta(&meta_content);

        Ok(ResultRecord {
            stdout,
            stderr,
            exit_code: output.exit_code,
            meta,
        })
    }

    fn build_argv(
        &self,
        meta_path: &std::path::Path,
        cmdline: &[String],
        env: &[(String, String)],
        merge_outputs: bool,
    ) -> Vec<String> {
        let mut argv = vec![
            "--box-id".to_string(),
            self.box_id.to_string(),
            "--cg".to_string(),
        ];

        for dir in &self.allowed_dirs {
            argv.push("-d".to_string());
            argv.push(dir.to_string_lossy().into_owned());
        }

        argv.extend(self.options.to_flags());

        for name in FORWARDED_ENV_VARS {
            if let Ok(value) = std::env::var(name) {
                argv.push(format!("--env={name}={value}"));
            }
        }
        for (key, value) in env {
            argv.push(format!("--env={key}={value}"));
        }

        argv.push(format!("--meta={}", meta_path.display()));
        argv.push("--stdout=._stdout".to_string());
        if merge_outputs {
            argv.push("--stderr-to-stdout".to_string());
        } else {
            argv.push("--stderr=._stderr".to_string());
        }

        argv.push("--run".to_string());
        argv.push("--".to_string());
        argv.extend(cmdline.iter().cloned());

        argv
    }

    /// Closes the session: parses meta even if `run()` was never called
    /// (yielding all-defaults), and in auto-allocation mode also runs
    /// `--cleanup`, propagating its failure as `CleanupFailure` (legacy
    /// behavior — explicit mode's cleanup is owned by the acquisition scope
    /// and never reaches here).
    pub async fn exit(&mut self) -> Result<MetaRecord, IsolateError> {
        let meta = match std::mem::replace(&mut self.state, State::Exited) {
            State::Entered { meta_file, .. } => {
                let content = fs::read_to_string(meta_file.path())
                    .await
                    .unwrap_or_default();
                parse_meta(&content)
            }
            State::Constructed => MetaRecord::default(),
            State::Exited => {
                return Err(IsolateError::IsolatorInternal {
                    command: "exit".to_string(),
                    stdout: String::new(),
                    stderr: "session already exited".to_string(),
                })
            }
        };

        self.mode.teardown(self.box_id).await?;

        Ok(meta)
    }
}

/// Scans `box_root`'s immediate children to compute the in-use set, then
/// tries each remaining candidate with `--init` until one succeeds. Skips a
/// candidate that raced us (exit 2, stderr containing "already exists");
/// fails hard on any other non-zero exit. Exhausting the candidate set is
/// `BoxUnavailable("no box available")`.
async fn auto_allocate_box() -> Result<(BoxId, PathBuf), IsolateError> {
    let config = get_config();

    let mut in_use = std::collections::HashSet::new();
    if let Ok(mut entries) = fs::read_dir(&config.box_root).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<u32>() {
                    in_use.insert(id);
                }
            }
        }
    }

    for candidate in 0..config.num_boxes {
        if in_use.contains(&candidate) {
            continue;
        }
        let box_id = BoxId(candidate);

        let output = communicate(
            &[
                "--box-id".to_string(),
                box_id.to_string(),
                "--cg".to_string(),
                "--init".to_string(),
            ],
            b"",
        )
        .await?;

        if output.exit_code == 0 {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Ok((box_id, PathBuf::from(path)));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.exit_code == 2 && stderr.contains("already exists") {
            continue;
        }

        return Err(IsolateError::BoxUnavailable {
            box_id,
            reason: stderr.into_owned(),
        });
    }

    Err(IsolateError::BoxUnavailable {
        box_id: BoxId(0),
        reason: "no box available".to_string(),
    })
}

/// A request's compile-then-test pipeline groups several `ResultRecord`s
/// together; not part of the spec's core data model but a convenience for
/// callers driving multiple sessions against the same box. Kept minimal —
/// ordering and per-test bookkeeping remain the caller's job.
#[derive(Debug, Default)]
pub struct SessionOutcomes {
    pub records: BTreeMap<String, ResultRecord>,
}
