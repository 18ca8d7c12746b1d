use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use snafu::{OptionExt, ensure};

use crate::device::{Backend, EntryPoint, ProgramGroupDesc, SBT_RECORD_HEADER_SIZE, SbtHeader};
use crate::error::{CompilationSnafu, ExecutionSnafu, InvalidHandleSnafu, Result};
use crate::geometry::Aabb;
use crate::handle::{KernelHandle, ModuleHandle, ProgramGroupHandle};
use crate::options::CompileOptions;
use crate::queue::{BoundsLaunch, RayGenLaunch, Work};

use super::programs::{BoundsInvocation, HostPrograms, RayGenInvocation};

/// Marker written into every host SBT header after the group id and device.
pub const HOST_HEADER_MAGIC: [u8; 4] = *b"STRX";

/// Counters of live backend objects and work executed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub live_modules: usize,
    pub live_program_groups: usize,
    pub live_kernels: usize,
    pub compile_count: usize,
    pub raygen_launches: usize,
    pub bounds_launches: usize,
}

#[derive(Debug)]
struct HostModule {
    entries: BTreeSet<String>,
}

/// Emulated device backend.
///
/// "Compiles" PTX-like text by collecting its `.entry` symbols, and executes
/// launches by calling the closures registered in [`HostPrograms`].
#[derive(Debug)]
pub struct HostBackend {
    device: usize,
    name: String,
    reject_all: bool,
    programs: Arc<HostPrograms>,
    /// Shared by all backends of a platform so handles are unique across devices.
    next_handle: Arc<AtomicU64>,
    modules: Mutex<HashMap<ModuleHandle, HostModule>>,
    groups: Mutex<HashMap<ProgramGroupHandle, ProgramGroupDesc>>,
    kernels: Mutex<HashMap<KernelHandle, EntryPoint>>,
    compile_count: AtomicUsize,
    raygen_launches: AtomicUsize,
    bounds_launches: AtomicUsize,
}

impl HostBackend {
    pub(crate) fn new(
        device: usize,
        reject_all: bool,
        programs: Arc<HostPrograms>,
        next_handle: Arc<AtomicU64>,
    ) -> Self {
        Self {
            device,
            name: format!("host:{device}"),
            reject_all,
            programs,
            next_handle,
            modules: Mutex::default(),
            groups: Mutex::default(),
            kernels: Mutex::default(),
            compile_count: AtomicUsize::new(0),
            raygen_launches: AtomicUsize::new(0),
            bounds_launches: AtomicUsize::new(0),
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            live_modules: self.modules.lock().len(),
            live_program_groups: self.groups.lock().len(),
            live_kernels: self.kernels.lock().len(),
            compile_count: self.compile_count.load(Ordering::Acquire),
            raygen_launches: self.raygen_launches.load(Ordering::Acquire),
            bounds_launches: self.bounds_launches.load(Ordering::Acquire),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn compile_error(&self, log: impl Into<String>) -> crate::Error {
        CompilationSnafu { device: self.device, log: log.into() }.build()
    }

    fn check_entry(&self, modules: &HashMap<ModuleHandle, HostModule>, entry: &EntryPoint) -> Result<()> {
        let module = modules.get(&entry.module).context(InvalidHandleSnafu {
            kind: ModuleHandle::KIND,
            handle: entry.module.raw(),
            device: self.device,
        })?;
        ensure!(
            module.entries.contains(&entry.symbol),
            CompilationSnafu { device: self.device, log: format!("{} does not export `{}`", entry.module, entry.symbol) }
        );
        Ok(())
    }

    fn run_raygen(&self, launch: &RayGenLaunch) -> Result<()> {
        let desc = self.groups.lock().get(&launch.group).cloned().context(InvalidHandleSnafu {
            kind: ProgramGroupHandle::KIND,
            handle: launch.group.raw(),
            device: self.device,
        })?;
        let ProgramGroupDesc::RayGen(entry) = desc else {
            return ExecutionSnafu { device: self.device, reason: format!("{} is not a ray-generation group", launch.group) }
                .fail();
        };

        let record = launch.record.to_vec();
        ensure!(
            record.len() >= SBT_RECORD_HEADER_SIZE && record[..SBT_RECORD_HEADER_SIZE] == self.pack_header(launch.group)?,
            ExecutionSnafu { device: self.device, reason: "stale SBT record header" }
        );
        let program = self.programs.raygen(&entry.symbol).context(ExecutionSnafu {
            device: self.device,
            reason: format!("no host program registered for `{}`", entry.symbol),
        })?;

        let params = launch.params.as_ref().map(|buffer| buffer.to_vec());
        let [width, height] = launch.dims;
        for y in 0..height {
            for x in 0..width {
                program(&RayGenInvocation {
                    pixel: [x, y],
                    dims: launch.dims,
                    device: self.device,
                    record_data: &record[SBT_RECORD_HEADER_SIZE..],
                    params: params.as_deref(),
                });
            }
        }
        self.raygen_launches.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn run_bounds(&self, launch: &BoundsLaunch) -> Result<()> {
        let entry = self.kernels.lock().get(&launch.kernel).cloned().context(InvalidHandleSnafu {
            kind: KernelHandle::KIND,
            handle: launch.kernel.raw(),
            device: self.device,
        })?;
        let program = self.programs.bounds(&entry.symbol).context(ExecutionSnafu {
            device: self.device,
            reason: format!("no host bounds program registered for `{}`", entry.symbol),
        })?;

        let boxes: Vec<Aabb> = (0..launch.prim_count)
            .map(|prim_id| program(&BoundsInvocation { prim_id, device: self.device, geom_data: &launch.geom_data }))
            .collect();
        launch.output.copyin(bytemuck::cast_slice(&boxes))?;
        self.bounds_launches.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Collect the symbols named by `.entry` directives, as in `.visible .entry __raygen__main(`.
fn scan_entries(text: &str) -> BTreeSet<String> {
    let mut entries = BTreeSet::new();
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != ".entry" {
            continue;
        }
        if let Some(next) = tokens.next() {
            let symbol: String =
                next.chars().take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$')).collect();
            if !symbol.is_empty() {
                entries.insert(symbol);
            }
        }
    }
    entries
}

/// Messages of `.error <msg>` lines; a module containing any fails to compile.
fn scan_errors(text: &str) -> Vec<&str> {
    text.lines().filter_map(|line| line.trim_start().strip_prefix(".error")).map(str::trim).collect()
}

impl Backend for HostBackend {
    fn compile(&self, source: &[u8], options: &CompileOptions) -> Result<ModuleHandle> {
        ensure!(!self.reject_all, CompilationSnafu { device: self.device, log: "compiler unavailable on this device" });
        ensure!(
            options.max_trace_depth <= CompileOptions::MAX_TRACE_DEPTH_LIMIT,
            CompilationSnafu {
                device: self.device,
                log: format!(
                    "max trace depth {} exceeds limit {}",
                    options.max_trace_depth,
                    CompileOptions::MAX_TRACE_DEPTH_LIMIT
                ),
            }
        );

        let text = std::str::from_utf8(source).map_err(|e| self.compile_error(format!("source is not UTF-8: {e}")))?;
        let errors = scan_errors(text);
        if !errors.is_empty() {
            return Err(self.compile_error(errors.join("\n")));
        }
        let entries = scan_entries(text);
        ensure!(!entries.is_empty(), CompilationSnafu { device: self.device, log: "no .entry directive found" });

        let handle = ModuleHandle(self.next_id());
        tracing::trace!(device = self.device, %handle, entries = entries.len(), "host module compiled");
        self.modules.lock().insert(handle, HostModule { entries });
        self.compile_count.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    fn destroy_module(&self, module: ModuleHandle) -> Result<()> {
        self.modules.lock().remove(&module).context(InvalidHandleSnafu {
            kind: ModuleHandle::KIND,
            handle: module.raw(),
            device: self.device,
        })?;
        self.kernels.lock().retain(|_, entry| entry.module != module);
        Ok(())
    }

    fn create_program_group(&self, desc: &ProgramGroupDesc) -> Result<ProgramGroupHandle> {
        {
            let modules = self.modules.lock();
            match desc {
                ProgramGroupDesc::RayGen(entry) => self.check_entry(&modules, entry)?,
                ProgramGroupDesc::HitGroup { closest_hit, any_hit, intersection } => {
                    for entry in [closest_hit, any_hit, intersection].into_iter().flatten() {
                        self.check_entry(&modules, entry)?;
                    }
                }
            }
        }

        let handle = ProgramGroupHandle(self.next_id());
        self.groups.lock().insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_program_group(&self, group: ProgramGroupHandle) -> Result<()> {
        self.groups.lock().remove(&group).map(|_| ()).context(InvalidHandleSnafu {
            kind: ProgramGroupHandle::KIND,
            handle: group.raw(),
            device: self.device,
        })
    }

    fn load_kernel(&self, entry: &EntryPoint) -> Result<KernelHandle> {
        self.check_entry(&self.modules.lock(), entry)?;

        let mut kernels = self.kernels.lock();
        if let Some((handle, _)) = kernels.iter().find(|(_, existing)| *existing == entry) {
            return Ok(*handle);
        }
        let handle = KernelHandle(self.next_id());
        kernels.insert(handle, entry.clone());
        Ok(handle)
    }

    fn pack_header(&self, group: ProgramGroupHandle) -> Result<SbtHeader> {
        ensure!(
            self.groups.lock().contains_key(&group),
            InvalidHandleSnafu { kind: ProgramGroupHandle::KIND, handle: group.raw(), device: self.device }
        );

        let mut header = [0u8; SBT_RECORD_HEADER_SIZE];
        header[..8].copy_from_slice(&group.raw().to_le_bytes());
        header[8..16].copy_from_slice(&(self.device as u64).to_le_bytes());
        header[16..20].copy_from_slice(&HOST_HEADER_MAGIC);
        Ok(header)
    }

    fn execute(&self, work: &Work) -> Result<()> {
        match work {
            Work::RayGen(launch) => self.run_raygen(launch),
            Work::Bounds(launch) => self.run_bounds(launch),
            Work::Copy(copy) => copy.apply(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

