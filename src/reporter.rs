//! The reporter: configuration, enable-time setup, and the crash entry
//! point.
//!
//! A [`Reporter`] is an ordinary value constructed at startup. Enabling it
//! opens the output file, captures every string the report will need,
//! allocates the output buffer, and installs chained signal handlers on an
//! alternate stack. From that point the crash path touches only
//! pre-allocated state through a single process-global context pointer —
//! the one concession to globals, forced by signal dispositions being
//! process-global.
//!
//! Both the signal handler and the panic hook converge on [`crash_now`]:
//! there is no self-signaling trick, the exception record travels as an
//! argument.

use core::ffi::c_void;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::debug_log::debug_log;
use crate::error::Error;
use crate::image_list::ImageList;
use crate::macho::MachImage;
use crate::signal::{self, FATAL_SIGNALS};
use crate::task::CurrentTask;
use crate::thread_state::{self, ThreadState};
use crate::writer::{
    self, BufferedFile, LogWriterContext, SignalInfo, DEFAULT_CAPACITY,
};

pub use crate::writer::ExceptionRecord;

/// Which language-level exception (panic) handling to install.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExceptionHandling {
    /// Signals only; panics reach the default panic handler untouched.
    None,
    /// Hook the panic path and record uncaught panics before they abort.
    #[default]
    UncaughtOnly,
    /// Like `UncaughtOnly`; panics that unwind into a `catch_unwind` are
    /// never seen by the hook, so the two behave identically today.
    All,
}

pub struct Config {
    pub application_identifier: String,
    pub application_version: String,
    pub exception_handling: ExceptionHandling,
    pub output_path: String,
    /// Invoked after the report has been flushed, still in signal context:
    /// only async-signal-safe work is permitted inside.
    pub post_crash_callback: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Config {
    pub fn new(application_identifier: &str, application_version: &str, output_path: &str) -> Self {
        Config {
            application_identifier: application_identifier.into(),
            application_version: application_version.into(),
            exception_handling: ExceptionHandling::default(),
            output_path: output_path.into(),
            post_crash_callback: None,
        }
    }
}

struct HandlerContext {
    writer: LogWriterContext,
    file: BufferedFile,
    images: ImageList,
    previous: signal::PreviousActions,
    post_crash: Option<Box<dyn Fn() + Send + Sync>>,
}

/// The single pre-registered pointer the signal handler reads.
static CONTEXT: AtomicPtr<HandlerContext> = AtomicPtr::new(core::ptr::null_mut());
/// Reentrancy guard: a second fault while reporting must not recurse.
static HANDLING: AtomicBool = AtomicBool::new(false);

pub struct Reporter {
    config: Config,
}

impl Reporter {
    pub fn new(config: Config) -> Self {
        Reporter { config }
    }

    /// Open the output, capture the report context, and hook the fatal
    /// signals. Only one reporter per process can be enabled.
    pub fn enable(self) -> Result<(), Error> {
        if !CONTEXT.load(Ordering::SeqCst).is_null() {
            tracing::warn!("crash reporter already enabled");
            return Err(Error::Internal);
        }

        let path = CString::new(self.config.output_path.as_str()).map_err(|_| Error::Internal)?;
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_CREAT | libc::O_TRUNC | libc::O_WRONLY,
                0o644,
            )
        };
        if fd < 0 {
            tracing::error!(path = %self.config.output_path, "could not open crash log");
            return Err(Error::Access);
        }

        let writer = gather_writer_context(&self.config);
        let file = BufferedFile::new(fd, DEFAULT_CAPACITY);
        let images = ImageList::new();

        let previous = signal::install_handlers(crash_signal_handler)?;
        let context = Box::new(HandlerContext {
            writer,
            file,
            images,
            previous,
            post_crash: self.config.post_crash_callback,
        });
        CONTEXT.store(Box::into_raw(context), Ordering::SeqCst);

        if self.config.exception_handling != ExceptionHandling::None {
            install_panic_hook();
        }

        tracing::info!(
            path = %self.config.output_path,
            signals = FATAL_SIGNALS.len(),
            "crash reporter enabled"
        );
        Ok(())
    }
}

/// Build the enable-time snapshot of system, machine, and process facts.
fn gather_writer_context(config: &Config) -> LogWriterContext {
    let mut context = LogWriterContext {
        app_identifier: config.application_identifier.clone(),
        app_version: config.application_version.clone(),
        process_id: std::process::id(),
        parent_process_id: unsafe { libc::getppid() } as u32,
        native: true,
        report_uuid: *uuid::Uuid::new_v4().as_bytes(),
        user_requested: false,
        ..Default::default()
    };

    unsafe {
        let mut info: libc::utsname = core::mem::zeroed();
        if libc::uname(&mut info) == 0 {
            context.os_version = cstr_field(&info.release);
            context.os_build = cstr_field(&info.version);
            context.model = cstr_field(&info.machine);
        }
        let cores = libc::sysconf(libc::_SC_NPROCESSORS_CONF);
        let online = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);
        context.processor_count = cores.max(0) as u32;
        context.logical_processor_count = online.max(0) as u32;
    }

    if let Ok(exe) = std::env::current_exe() {
        context.process_path = exe.to_string_lossy().into_owned();
        if let Some(name) = exe.file_name() {
            context.process_name = name.to_string_lossy().into_owned();
        }
    }
    context
}

fn cstr_field(field: &[libc::c_char]) -> String {
    let bytes: &[u8] = unsafe { core::slice::from_raw_parts(field.as_ptr() as *const u8, field.len()) };
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

/// Loader upcall: a new image was mapped. Runs on the loader's thread.
pub fn on_image_add(header: u64, slide: i64, path: &str) {
    let context = CONTEXT.load(Ordering::SeqCst);
    if context.is_null() {
        return;
    }
    let context = unsafe { &*context };
    match MachImage::new(&CurrentTask, header, slide, path) {
        Ok(image) => context.images.append(image),
        Err(err) => {
            tracing::warn!(header, %err, "ignoring unparseable image");
        }
    }
}

/// Loader upcall: the image at `header` was unmapped.
pub fn on_image_remove(header: u64) {
    let context = CONTEXT.load(Ordering::SeqCst);
    if context.is_null() {
        return;
    }
    unsafe { &*context }.images.remove(header);
}

/// Write a crash report for the *current* thread right now.
///
/// This is the single convergence point: the signal handler calls it with
/// the fault's register state decoded from the `ucontext`, the panic hook
/// calls it with an exception record, and an application can call it to
/// produce a "generated" report on demand.
pub fn crash_now(exception: Option<&ExceptionRecord>) -> Result<(), Error> {
    let context = CONTEXT.load(Ordering::SeqCst);
    if context.is_null() {
        return Err(Error::Internal);
    }
    let signal = SignalInfo {
        signo: libc::SIGABRT,
        code: 0,
        address: 0,
    };
    thread_state::with_current_thread_state(|state| {
        handle_crash(unsafe { &mut *context }, state, &signal, exception);
        Ok(())
    })
}

extern "C" fn crash_signal_handler(
    signo: i32,
    info: *mut libc::siginfo_t,
    uctx: *mut c_void,
) {
    let context = CONTEXT.load(Ordering::SeqCst);
    if context.is_null() {
        return;
    }
    let context = unsafe { &mut *context };

    if !HANDLING.swap(true, Ordering::SeqCst) {
        #[cfg(target_os = "linux")]
        let fault_address = unsafe { (*info).si_addr() } as u64;
        #[cfg(not(target_os = "linux"))]
        let fault_address = unsafe { (*info).si_addr } as u64;
        let signal = SignalInfo {
            signo,
            code: unsafe { (*info).si_code },
            address: fault_address,
        };

        match signal::thread_state_from_ucontext(uctx) {
            Some(state) => handle_crash(context, &state, &signal, None),
            None => debug_log!("no register decoding for this target; skipping report"),
        }
    }

    unsafe { signal::chain_previous(&context.previous, signo, info, uctx) };
}

/// The crash pipeline: unwind, symbolicate, serialize, flush. Never
/// panics, never allocates, reports best-effort.
fn handle_crash(
    context: &mut HandlerContext,
    state: &ThreadState,
    signal: &SignalInfo,
    exception: Option<&ExceptionRecord>,
) {
    let task = CurrentTask;
    if let Err(err) = writer::write_report(
        &context.writer,
        &task,
        &context.images,
        state,
        signal,
        exception,
        &mut context.file,
    ) {
        debug_log!("report truncated: {}", err);
    }
    if let Err(err) = context.file.flush() {
        debug_log!("report flush failed: {}", err);
    }
    if let Some(callback) = &context.post_crash {
        callback();
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let mut record = ExceptionRecord::default();
        let _ = record.name.try_push_str("rust_panic");
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "panic"
        };
        // Truncate to the record's capacity; the report keeps the prefix.
        let take = message.len().min(record.reason.capacity());
        let mut end = take;
        while end > 0 && !message.is_char_boundary(end) {
            end -= 1;
        }
        let _ = record.reason.try_push_str(&message[..end]);

        if let Err(err) = crash_now(Some(&record)) {
            debug_log!("panic report failed: {}", err);
        }
        default_hook(info);
    }));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn crash_now_requires_an_enabled_reporter() {
        // No reporter enabled in the test process.
        assert_eq!(crash_now(None), Err(Error::Internal));
    }

    #[test]
    fn writer_context_snapshot_is_populated() {
        let config = Config::new("com.example.test", "9.9", "/tmp/ignored.plcrash");
        let context = gather_writer_context(&config);
        assert_eq!(context.app_identifier, "com.example.test");
        assert_eq!(context.app_version, "9.9");
        assert_eq!(context.process_id, std::process::id());
        assert!(!context.process_name.is_empty());
        assert!(context.processor_count > 0);
        assert_ne!(context.report_uuid, [0; 16]);
    }

    #[test]
    fn config_defaults() {
        let config = Config::new("a", "b", "/tmp/x");
        assert_eq!(config.exception_handling, ExceptionHandling::UncaughtOnly);
        assert!(config.post_crash_callback.is_none());
    }
}
