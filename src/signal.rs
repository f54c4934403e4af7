//! Signal plumbing: alternate stack, handler installation with chaining,
//! and `ucontext` decoding.
//!
//! Handlers run on a dedicated alternate stack because the faulting thread's
//! own stack may be exhausted or corrupt — and because the DWARF evaluation
//! scratch space is sized in tens of kilobytes. The previous disposition of
//! every hooked signal is preserved and re-dispatched after the report is
//! written, so debuggers and the default crash behavior still see the fault.

use core::ffi::c_void;
use core::ptr;

use crate::error::Error;
use crate::thread_state::ThreadState;

/// The synchronous fault signals the reporter hooks.
pub const FATAL_SIGNALS: &[i32] = &[
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGABRT,
    libc::SIGTRAP,
];

/// Alternate stack size. Needs headroom for the DWARF unwind context on
/// top of whatever the libc handler prologue uses.
const ALT_STACK_SIZE: usize = 512 * 1024;

pub(crate) type RawHandler = extern "C" fn(i32, *mut libc::siginfo_t, *mut c_void);

/// The dispositions that were replaced, for chaining.
pub(crate) struct PreviousActions {
    actions: [(i32, libc::sigaction); 6],
}

/// Install `handler` for the fatal signal set on a freshly mapped alternate
/// stack. Called once, at enable time.
pub(crate) fn install_handlers(handler: RawHandler) -> Result<PreviousActions, Error> {
    unsafe {
        let stack_base = libc::mmap(
            ptr::null_mut(),
            ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if stack_base == libc::MAP_FAILED {
            return Err(Error::NoMemory);
        }
        let stack = libc::stack_t {
            ss_sp: stack_base,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        if libc::sigaltstack(&stack, ptr::null_mut()) != 0 {
            return Err(Error::Internal);
        }

        let mut previous = PreviousActions {
            actions: [(0, core::mem::zeroed()); 6],
        };
        for (i, &signo) in FATAL_SIGNALS.iter().enumerate() {
            let mut action: libc::sigaction = core::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);

            let mut old: libc::sigaction = core::mem::zeroed();
            if libc::sigaction(signo, &action, &mut old) != 0 {
                return Err(Error::Internal);
            }
            previous.actions[i] = (signo, old);
        }
        Ok(previous)
    }
}

/// Hand the signal to whatever disposition was registered before us. For
/// the default disposition the signal is re-raised so the process still
/// dies the normal way.
pub(crate) unsafe fn chain_previous(
    previous: &PreviousActions,
    signo: i32,
    info: *mut libc::siginfo_t,
    uctx: *mut c_void,
) {
    let old = previous
        .actions
        .iter()
        .find(|(s, _)| *s == signo)
        .map(|(_, a)| *a);
    let Some(old) = old else { return };

    if old.sa_sigaction == libc::SIG_IGN {
        return;
    }
    if old.sa_sigaction == libc::SIG_DFL {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signo, &action, ptr::null_mut());
        libc::raise(signo);
        return;
    }
    if old.sa_flags & libc::SA_SIGINFO != 0 {
        let handler: RawHandler = core::mem::transmute(old.sa_sigaction);
        handler(signo, info, uctx);
    } else {
        let handler: extern "C" fn(i32) = core::mem::transmute(old.sa_sigaction);
        handler(signo);
    }
}

/// Decode the interrupted thread's integer registers out of the kernel's
/// `ucontext`.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) fn thread_state_from_ucontext(uctx: *const c_void) -> Option<ThreadState> {
    use crate::arch::x86_64::*;
    use crate::thread_state::Arch;

    let uc = unsafe { &*(uctx as *const libc::ucontext_t) };
    let gregs = &uc.uc_mcontext.gregs;
    let mut state = ThreadState::new(Arch::X86_64);
    let pairs = [
        (RAX, libc::REG_RAX),
        (RBX, libc::REG_RBX),
        (RCX, libc::REG_RCX),
        (RDX, libc::REG_RDX),
        (RDI, libc::REG_RDI),
        (RSI, libc::REG_RSI),
        (RBP, libc::REG_RBP),
        (RSP, libc::REG_RSP),
        (R8, libc::REG_R8),
        (R9, libc::REG_R9),
        (R10, libc::REG_R10),
        (R11, libc::REG_R11),
        (R12, libc::REG_R12),
        (R13, libc::REG_R13),
        (R14, libc::REG_R14),
        (R15, libc::REG_R15),
        (RIP, libc::REG_RIP),
    ];
    for (reg, greg) in pairs {
        state.set(reg, gregs[greg as usize] as u64);
    }
    Some(state)
}

#[cfg(all(target_os = "linux", target_arch = "x86"))]
pub(crate) fn thread_state_from_ucontext(uctx: *const c_void) -> Option<ThreadState> {
    use crate::arch::x86::*;
    use crate::thread_state::Arch;

    let uc = unsafe { &*(uctx as *const libc::ucontext_t) };
    let gregs = &uc.uc_mcontext.gregs;
    let mut state = ThreadState::new(Arch::X86);
    let pairs = [
        (EAX, libc::REG_EAX),
        (ECX, libc::REG_ECX),
        (EDX, libc::REG_EDX),
        (EBX, libc::REG_EBX),
        (ESP, libc::REG_ESP),
        (EBP, libc::REG_EBP),
        (ESI, libc::REG_ESI),
        (EDI, libc::REG_EDI),
        (EIP, libc::REG_EIP),
    ];
    for (reg, greg) in pairs {
        state.set(reg, gregs[greg as usize] as u32 as u64);
    }
    Some(state)
}

#[cfg(all(target_os = "linux", target_arch = "arm"))]
pub(crate) fn thread_state_from_ucontext(uctx: *const c_void) -> Option<ThreadState> {
    use crate::thread_state::Arch;

    let uc = unsafe { &*(uctx as *const libc::ucontext_t) };
    let mc = &uc.uc_mcontext;
    let mut state = ThreadState::new(Arch::Arm);
    // The kernel names r11/r12 fp/ip; our numbering is positional r0..pc.
    let values = [
        mc.arm_r0, mc.arm_r1, mc.arm_r2, mc.arm_r3, mc.arm_r4, mc.arm_r5, mc.arm_r6, mc.arm_r7,
        mc.arm_r8, mc.arm_r9, mc.arm_r10, mc.arm_fp, mc.arm_ip, mc.arm_sp, mc.arm_lr, mc.arm_pc,
    ];
    for (reg, value) in values.iter().enumerate() {
        state.set(reg as u8, *value as u64);
    }
    Some(state)
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub(crate) fn thread_state_from_ucontext(uctx: *const c_void) -> Option<ThreadState> {
    use crate::arch::x86_64::*;
    use crate::thread_state::Arch;

    let uc = unsafe { &*(uctx as *const libc::ucontext_t) };
    if uc.uc_mcontext.is_null() {
        return None;
    }
    let ss = unsafe { &(*uc.uc_mcontext).__ss };
    let mut state = ThreadState::new(Arch::X86_64);
    let pairs = [
        (RAX, ss.__rax),
        (RBX, ss.__rbx),
        (RCX, ss.__rcx),
        (RDX, ss.__rdx),
        (RDI, ss.__rdi),
        (RSI, ss.__rsi),
        (RBP, ss.__rbp),
        (RSP, ss.__rsp),
        (R8, ss.__r8),
        (R9, ss.__r9),
        (R10, ss.__r10),
        (R11, ss.__r11),
        (R12, ss.__r12),
        (R13, ss.__r13),
        (R14, ss.__r14),
        (R15, ss.__r15),
        (RIP, ss.__rip),
    ];
    for (reg, value) in pairs {
        state.set(reg, value);
    }
    Some(state)
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "x86", target_arch = "arm")),
    all(target_os = "macos", target_arch = "x86_64"),
)))]
pub(crate) fn thread_state_from_ucontext(_uctx: *const c_void) -> Option<ThreadState> {
    None
}
