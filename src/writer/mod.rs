//! The crash log writer.
//!
//! Serializes the report as a `"plcrash"` magic, a version byte, and a
//! stream of protobuf-encoded records: system info, machine info,
//! application info, process info, the crashed thread (register dump plus
//! caller-ward frames, each symbolicated against the Objective-C metadata
//! when possible), the loaded images, an optional uncaught-exception
//! record, the signal, and the report info.
//!
//! Everything string-like is captured when the reporter is enabled; at
//! crash time the writer only reads, measures, and emits. A failing
//! subsystem costs its own record, never the report: an empty backtrace
//! still produces system info, images, and the signal record.

mod file;
pub(crate) mod proto;

use core::fmt::Write as _;

use arrayvec::{ArrayString, ArrayVec};

use crate::debug_log::debug_log;
use crate::error::Error;
use crate::image_list::{ImageList, ImageListReader};
use crate::macho::MachImage;
use crate::objc::{self, ObjCContext};
use crate::task::TaskMemory;
use crate::thread_state::{Arch, ThreadState};
use crate::unwind::{Cursor, MAX_FRAME_DEPTH};

pub use file::{BufferedFile, DEFAULT_CAPACITY};
use proto::{
    put_bool, put_bytes, put_message_header, put_str, put_u32, put_u64, Measure, ProtoSink,
};

pub const MAGIC: &[u8] = b"plcrash";
pub const VERSION: u8 = 1;

const FIELD_SYSTEM_INFO: u32 = 1;
const FIELD_APP_INFO: u32 = 2;
const FIELD_THREADS: u32 = 3;
const FIELD_BINARY_IMAGES: u32 = 4;
const FIELD_EXCEPTION: u32 = 5;
const FIELD_SIGNAL: u32 = 6;
const FIELD_PROCESS_INFO: u32 = 7;
const FIELD_MACHINE_INFO: u32 = 8;
const FIELD_REPORT_INFO: u32 = 9;

/// Pre-captured report strings and identifiers. Populated at enable time so
/// the crash path performs no discovery.
#[derive(Clone, Debug, Default)]
pub struct LogWriterContext {
    pub app_identifier: String,
    pub app_version: String,
    pub os_version: String,
    pub os_build: String,
    pub model: String,
    pub cpu_type: u64,
    pub cpu_subtype: u64,
    pub processor_count: u32,
    pub logical_processor_count: u32,
    pub process_name: String,
    pub process_id: u32,
    pub process_path: String,
    pub parent_process_id: u32,
    pub native: bool,
    pub report_uuid: [u8; 16],
    pub user_requested: bool,
}

/// The faulting signal, as recorded in the report.
#[derive(Clone, Copy, Debug)]
pub struct SignalInfo {
    pub signo: i32,
    pub code: i32,
    pub address: u64,
}

impl SignalInfo {
    pub fn name(&self) -> &'static str {
        match self.signo {
            libc::SIGSEGV => "SIGSEGV",
            libc::SIGBUS => "SIGBUS",
            libc::SIGFPE => "SIGFPE",
            libc::SIGILL => "SIGILL",
            libc::SIGABRT => "SIGABRT",
            libc::SIGTRAP => "SIGTRAP",
            _ => "UNKNOWN",
        }
    }
}

/// An uncaught language-level exception, captured before converging on the
/// crash pipeline. Fixed-capacity so it can be built anywhere.
#[derive(Clone, Debug, Default)]
pub struct ExceptionRecord {
    pub name: ArrayString<128>,
    pub reason: ArrayString<512>,
    pub callstack: ArrayVec<u64, 128>,
}

fn os_code() -> u64 {
    if cfg!(target_os = "macos") {
        0
    } else if cfg!(target_os = "ios") {
        1
    } else if cfg!(target_os = "linux") {
        100
    } else {
        u8::MAX as u64
    }
}

fn arch_code(arch: Arch) -> u64 {
    match arch {
        Arch::X86 => 0,
        Arch::X86_64 => 1,
        Arch::Arm => 2,
    }
}

/// Emit one length-delimited record: a sizing pass against [`Measure`],
/// then the header and the real bytes.
fn emit_message(
    file: &mut BufferedFile,
    field: u32,
    body: &mut dyn FnMut(&mut dyn ProtoSink) -> Result<usize, Error>,
) -> Result<(), Error> {
    let mut measure = Measure(0);
    body(&mut measure)?;
    put_message_header(file, field, measure.0)?;
    body(file)?;
    Ok(())
}

/// Walk the stack once, collecting frame instruction pointers. A traversal
/// error keeps the frames gathered so far; the report is best-effort.
fn collect_frames<T: TaskMemory + ?Sized>(
    task: &T,
    images: &ImageList,
    state: &ThreadState,
) -> ArrayVec<u64, MAX_FRAME_DEPTH> {
    let mut pcs = ArrayVec::new();
    let mut cursor = Cursor::new(task, images, *state);
    loop {
        match cursor.next() {
            Ok(Some(frame)) => {
                if let Ok(ip) = frame.ip() {
                    if pcs.try_push(ip).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug_log!("backtrace terminated early: {}", err);
                break;
            }
        }
    }
    pcs
}

/// Resolve `pc` to an Objective-C method identity, formatted the
/// conventional way: `-[Class selector]` or `+[Class selector]`.
fn resolve_symbol<T: TaskMemory + ?Sized>(
    task: &T,
    images: &ImageListReader<'_>,
    objc: &mut ObjCContext,
    pc: u64,
) -> Option<(ArrayString<320>, u64)> {
    let image = images.find_by_address(pc)?;
    let mut name = ArrayString::new();
    let mut start = 0;
    let mut found = false;
    objc::find_method(task, image, objc, pc, &mut |is_class_method, class, sel, imp| {
        found = true;
        start = imp;
        let sigil = if is_class_method { '+' } else { '-' };
        let _ = write!(name, "{sigil}[{class} {sel}]");
    })
    .ok()?;
    found.then_some((name, start))
}

fn frame_body(
    sink: &mut dyn ProtoSink,
    pc: u64,
    symbol: Option<&(ArrayString<320>, u64)>,
) -> Result<usize, Error> {
    let mut n = put_u64(sink, 1, pc)?;
    if let Some((name, start)) = symbol {
        let mut body = Measure(0);
        put_str(&mut body, 1, name)?;
        put_u64(&mut body, 2, *start)?;
        n += put_message_header(sink, 2, body.0)?;
        n += put_str(sink, 1, name)?;
        n += put_u64(sink, 2, *start)?;
    }
    Ok(n)
}

fn write_frame<T: TaskMemory + ?Sized>(
    sink: &mut dyn ProtoSink,
    task: &T,
    images: &ImageListReader<'_>,
    objc: &mut ObjCContext,
    field: u32,
    pc: u64,
) -> Result<usize, Error> {
    let symbol = resolve_symbol(task, images, objc, pc);
    let mut body = Measure(0);
    frame_body(&mut body, pc, symbol.as_ref())?;
    let mut n = put_message_header(sink, field, body.0)?;
    n += frame_body(sink, pc, symbol.as_ref())?;
    Ok(n)
}

fn write_thread_body<T: TaskMemory + ?Sized>(
    sink: &mut dyn ProtoSink,
    task: &T,
    images: &ImageListReader<'_>,
    objc: &mut ObjCContext,
    pcs: &[u64],
    state: &ThreadState,
) -> Result<usize, Error> {
    let mut n = put_u32(sink, 1, 0)?; // thread number
    for &pc in pcs {
        n += write_frame(sink, task, images, objc, 2, pc)?;
    }
    n += put_bool(sink, 3, true)?; // crashed

    // Register dump: name/value pairs for every known register of frame 0.
    let arch = state.arch();
    for reg in 0..arch.reg_count() as u8 {
        let Ok(value) = state.get(reg) else { continue };
        let name = arch.reg_name(reg).unwrap_or("?");
        let mut body = Measure(0);
        put_str(&mut body, 1, name)?;
        put_u64(&mut body, 2, value)?;
        n += put_message_header(sink, 4, body.0)?;
        n += put_str(sink, 1, name)?;
        n += put_u64(sink, 2, value)?;
    }
    Ok(n)
}

fn write_image_body(sink: &mut dyn ProtoSink, image: &MachImage) -> Result<usize, Error> {
    let range = image.text_range();
    let mut n = put_u64(sink, 1, image.base())?;
    n += put_u64(sink, 2, range.end - range.start)?;
    n += put_str(sink, 3, image.path())?;
    if let Some(uuid) = image.uuid() {
        n += put_bytes(sink, 4, &uuid)?;
    }
    n += put_u64(sink, 5, image.cpu_type() as u64)?;
    n += put_u64(sink, 6, image.cpu_subtype() as u64)?;
    Ok(n)
}

/// Write the full report for the crashed thread described by `state`.
///
/// Output-capacity exhaustion aborts with `NoMemory` (the buffer keeps the
/// truncated prefix); every other subsystem failure costs only its own
/// record.
pub fn write_report<T: TaskMemory + ?Sized>(
    context: &LogWriterContext,
    task: &T,
    images: &ImageList,
    state: &ThreadState,
    signal: &SignalInfo,
    exception: Option<&ExceptionRecord>,
    file: &mut BufferedFile,
) -> Result<(), Error> {
    file.write(MAGIC)?;
    file.write(&[VERSION])?;

    let timestamp = unsafe { libc::time(core::ptr::null_mut()) } as u64;
    emit_message(file, FIELD_SYSTEM_INFO, &mut |sink| {
        let mut n = put_u64(sink, 1, os_code())?;
        n += put_str(sink, 2, &context.os_version)?;
        n += put_u64(sink, 3, arch_code(state.arch()))?;
        n += put_u64(sink, 4, timestamp)?;
        n += put_str(sink, 5, &context.os_build)?;
        Ok(n)
    })?;

    emit_message(file, FIELD_MACHINE_INFO, &mut |sink| {
        let mut n = put_str(sink, 1, &context.model)?;
        n += put_u64(sink, 2, context.cpu_type)?;
        n += put_u64(sink, 3, context.cpu_subtype)?;
        n += put_u32(sink, 4, context.processor_count)?;
        n += put_u32(sink, 5, context.logical_processor_count)?;
        Ok(n)
    })?;

    emit_message(file, FIELD_APP_INFO, &mut |sink| {
        let mut n = put_str(sink, 1, &context.app_identifier)?;
        n += put_str(sink, 2, &context.app_version)?;
        Ok(n)
    })?;

    emit_message(file, FIELD_PROCESS_INFO, &mut |sink| {
        let mut n = put_str(sink, 1, &context.process_name)?;
        n += put_u32(sink, 2, context.process_id)?;
        n += put_str(sink, 3, &context.process_path)?;
        n += put_u32(sink, 5, context.parent_process_id)?;
        n += put_bool(sink, 6, context.native)?;
        Ok(n)
    })?;

    // The crashed thread: register dump, then caller-ward frames.
    let pcs = collect_frames(task, images, state);
    let reader = images.reader();
    let mut objc = ObjCContext::new();
    emit_message(file, FIELD_THREADS, &mut |sink| {
        write_thread_body(sink, task, &reader, &mut objc, &pcs, state)
    })?;

    // Images are dumped after all threads.
    for image in reader.iter() {
        emit_message(file, FIELD_BINARY_IMAGES, &mut |sink| {
            write_image_body(sink, image)
        })?;
    }

    if let Some(exception) = exception {
        emit_message(file, FIELD_EXCEPTION, &mut |sink| {
            let mut n = put_str(sink, 1, &exception.name)?;
            n += put_str(sink, 2, &exception.reason)?;
            for &pc in &exception.callstack {
                n += write_frame(sink, task, &reader, &mut objc, 3, pc)?;
            }
            Ok(n)
        })?;
    }

    emit_message(file, FIELD_SIGNAL, &mut |sink| {
        let mut n = put_str(sink, 1, signal.name())?;
        n += put_u64(sink, 2, signal.code as u64)?;
        n += put_u64(sink, 3, signal.address)?;
        Ok(n)
    })?;

    emit_message(file, FIELD_REPORT_INFO, &mut |sink| {
        let mut n = put_bool(sink, 1, context.user_requested)?;
        n += put_bytes(sink, 2, &context.report_uuid)?;
        Ok(n)
    })?;

    Ok(())
}
