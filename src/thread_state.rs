//! Architecture-neutral register snapshots.
//!
//! A [`ThreadState`] records the integer registers of one thread at one
//! point in time, together with a bitmap of which slots actually hold a
//! known value. Frame readers consume a state and produce the caller's
//! state; registers whose caller-side values are unknowable (the volatile
//! set) are left unset in the output rather than carrying garbage.

use core::fmt;

use crate::arch::{arm, x86, x86_64};
use crate::display_utils::HexNum;
use crate::error::Error;

/// The architectures whose frames we can walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
}

impl Arch {
    pub fn reg_count(self) -> usize {
        match self {
            Arch::X86 => x86::REG_COUNT,
            Arch::X86_64 => x86_64::REG_COUNT,
            Arch::Arm => arm::REG_COUNT,
        }
    }

    /// Pointer width in bytes.
    pub fn pointer_size(self) -> u64 {
        match self {
            Arch::X86 | Arch::Arm => 4,
            Arch::X86_64 => 8,
        }
    }

    pub fn reg_name(self, reg: u8) -> Option<&'static str> {
        let names: &[&'static str] = match self {
            Arch::X86 => &x86::NAMES,
            Arch::X86_64 => &x86_64::NAMES,
            Arch::Arm => &arm::NAMES,
        };
        names.get(reg as usize).copied()
    }

    /// The ABI's callee-preserved register set.
    pub fn callee_saved(self) -> &'static [u8] {
        match self {
            Arch::X86 => x86::CALLEE_SAVED,
            Arch::X86_64 => x86_64::CALLEE_SAVED,
            Arch::Arm => arm::CALLEE_SAVED,
        }
    }

    pub fn ip_reg(self) -> u8 {
        match self {
            Arch::X86 => x86::IP,
            Arch::X86_64 => x86_64::IP,
            Arch::Arm => arm::IP,
        }
    }

    pub fn sp_reg(self) -> u8 {
        match self {
            Arch::X86 => x86::SP,
            Arch::X86_64 => x86_64::SP,
            Arch::Arm => arm::SP,
        }
    }

    pub fn fp_reg(self) -> u8 {
        match self {
            Arch::X86 => x86::FP,
            Arch::X86_64 => x86_64::FP,
            Arch::Arm => arm::FP,
        }
    }

    fn dwarf_table(self) -> &'static [(u8, u16)] {
        match self {
            Arch::X86 => x86::DWARF,
            Arch::X86_64 => x86_64::DWARF,
            Arch::Arm => arm::DWARF,
        }
    }

    /// Map a logical register number to its DWARF column.
    pub fn reg_to_dwarf(self, reg: u8) -> Option<u16> {
        self.dwarf_table()
            .iter()
            .find(|(r, _)| *r == reg)
            .map(|(_, d)| *d)
    }

    /// Map a DWARF column back to a logical register number.
    pub fn reg_from_dwarf(self, dwarf: u16) -> Option<u8> {
        self.dwarf_table()
            .iter()
            .find(|(_, d)| *d == dwarf)
            .map(|(r, _)| *r)
    }
}

pub const MAX_REG_COUNT: usize = 17;

#[derive(Clone, Copy)]
pub struct ThreadState {
    arch: Arch,
    regs: [u64; MAX_REG_COUNT],
    valid: u32,
}

impl ThreadState {
    /// An empty snapshot: every register unset.
    pub fn new(arch: Arch) -> Self {
        ThreadState {
            arch,
            regs: [0; MAX_REG_COUNT],
            valid: 0,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn has(&self, reg: u8) -> bool {
        (reg as usize) < self.arch.reg_count() && self.valid & (1 << reg) != 0
    }

    /// Read a register. Reading a slot that was never written is an error,
    /// not a zero.
    pub fn get(&self, reg: u8) -> Result<u64, Error> {
        if !self.has(reg) {
            return Err(Error::NotFound);
        }
        Ok(self.regs[reg as usize])
    }

    /// Write a register, marking it valid.
    pub fn set(&mut self, reg: u8, value: u64) {
        if (reg as usize) < self.arch.reg_count() {
            self.regs[reg as usize] = value;
            self.valid |= 1 << reg;
        }
    }

    /// Mark a register unknown without touching its slot.
    pub(crate) fn clear(&mut self, reg: u8) {
        if (reg as usize) < self.arch.reg_count() {
            self.valid &= !(1 << reg);
        }
    }

    /// Forget every register outside the callee-preserved set. After a call
    /// instruction the caller-side values of volatile registers are by
    /// definition unknowable.
    pub fn clear_volatile(&mut self) {
        let mut keep = 0u32;
        for &reg in self.arch.callee_saved() {
            keep |= 1 << reg;
        }
        self.valid &= keep;
    }

    pub fn ip(&self) -> Result<u64, Error> {
        self.get(self.arch.ip_reg())
    }

    pub fn sp(&self) -> Result<u64, Error> {
        self.get(self.arch.sp_reg())
    }

    pub fn fp(&self) -> Result<u64, Error> {
        self.get(self.arch.fp_reg())
    }

    pub fn set_ip(&mut self, value: u64) {
        self.set(self.arch.ip_reg(), value);
    }

    pub fn set_sp(&mut self, value: u64) {
        self.set(self.arch.sp_reg(), value);
    }

    pub fn set_fp(&mut self, value: u64) {
        self.set(self.arch.fp_reg(), value);
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_map();
        for reg in 0..self.arch.reg_count() as u8 {
            if self.has(reg) {
                s.entry(
                    &self.arch.reg_name(reg).unwrap_or("?"),
                    &HexNum(self.regs[reg as usize]),
                );
            }
        }
        s.finish()
    }
}

/// Capture the calling thread's integer registers and hand them to `f`.
///
/// The contract is that the capture is taken *as if* `f` were invoked from
/// the caller's own frame: the trampoline's activation record is
/// transparent with respect to the stack pointer, the return address, and
/// every callee-saved register. An implementation that returned a snapshot
/// and then read it back would violate this (returning rewinds the stack it
/// just described), which is why the capture and the callback share one
/// logical activation.
#[cfg(target_arch = "x86_64")]
pub fn with_current_thread_state<F>(f: F) -> Result<(), Error>
where
    F: FnOnce(&ThreadState) -> Result<(), Error>,
{
    use core::ffi::c_void;

    struct Ctx<F> {
        f: Option<F>,
        result: Result<(), Error>,
    }

    extern "C" fn stage2<F>(regs: *const u64, ctx: *mut c_void)
    where
        F: FnOnce(&ThreadState) -> Result<(), Error>,
    {
        let ctx = unsafe { &mut *(ctx as *mut Ctx<F>) };
        let mut state = ThreadState::new(Arch::X86_64);
        for reg in 0..x86_64::REG_COUNT {
            state.set(reg as u8, unsafe { *regs.add(reg) });
        }
        ctx.result = match ctx.f.take() {
            Some(f) => f(&state),
            None => Err(Error::Internal),
        };
    }

    // Register buffer layout written by the trampoline, in logical register
    // order: rax rbx rcx rdx rdi rsi rbp rsp r8..r15 rip.
    #[unsafe(naked)]
    unsafe extern "C" fn capture_raw(
        ctx: *mut c_void,
        stage2: extern "C" fn(*const u64, *mut c_void),
    ) {
        core::arch::naked_asm!(
            "sub rsp, 136",
            "mov [rsp + 0], rax",
            "mov [rsp + 8], rbx",
            "mov [rsp + 16], rcx",
            "mov [rsp + 24], rdx",
            "mov [rsp + 32], rdi",
            "mov [rsp + 40], rsi",
            "mov [rsp + 48], rbp",
            // The caller's rsp: entry rsp plus the return-address slot.
            "lea rax, [rsp + 144]",
            "mov [rsp + 56], rax",
            "mov [rsp + 64], r8",
            "mov [rsp + 72], r9",
            "mov [rsp + 80], r10",
            "mov [rsp + 88], r11",
            "mov [rsp + 96], r12",
            "mov [rsp + 104], r13",
            "mov [rsp + 112], r14",
            "mov [rsp + 120], r15",
            // The caller's rip: our own return address.
            "mov rax, [rsp + 136]",
            "mov [rsp + 128], rax",
            "mov rax, rsi",
            "mov rsi, rdi",
            "mov rdi, rsp",
            "call rax",
            "add rsp, 136",
            "ret",
        )
    }

    let mut ctx = Ctx {
        f: Some(f),
        result: Err(Error::Internal),
    };
    unsafe {
        capture_raw(&mut ctx as *mut Ctx<F> as *mut c_void, stage2::<F>);
    }
    ctx.result
}

#[cfg(target_arch = "x86")]
pub fn with_current_thread_state<F>(f: F) -> Result<(), Error>
where
    F: FnOnce(&ThreadState) -> Result<(), Error>,
{
    use core::ffi::c_void;

    struct Ctx<F> {
        f: Option<F>,
        result: Result<(), Error>,
    }

    extern "C" fn stage2<F>(regs: *const u32, ctx: *mut c_void)
    where
        F: FnOnce(&ThreadState) -> Result<(), Error>,
    {
        let ctx = unsafe { &mut *(ctx as *mut Ctx<F>) };
        let mut state = ThreadState::new(Arch::X86);
        for reg in 0..x86::REG_COUNT {
            state.set(reg as u8, unsafe { *regs.add(reg) } as u64);
        }
        ctx.result = match ctx.f.take() {
            Some(f) => f(&state),
            None => Err(Error::Internal),
        };
    }

    // Buffer layout: eax ecx edx ebx esp ebp esi edi eip.
    #[unsafe(naked)]
    unsafe extern "C" fn capture_raw(
        ctx: *mut c_void,
        stage2: extern "C" fn(*const u32, *mut c_void),
    ) {
        core::arch::naked_asm!(
            "sub esp, 36",
            "mov [esp + 0], eax",
            "mov [esp + 4], ecx",
            "mov [esp + 8], edx",
            "mov [esp + 12], ebx",
            // The caller's esp: entry esp plus the return-address slot.
            "lea eax, [esp + 40]",
            "mov [esp + 16], eax",
            "mov [esp + 20], ebp",
            "mov [esp + 24], esi",
            "mov [esp + 28], edi",
            "mov eax, [esp + 36]",
            "mov [esp + 32], eax",
            // cdecl: stage2 is at entry [esp + 8], ctx at [esp + 4].
            "mov eax, [esp + 44]",
            "mov ecx, [esp + 40]",
            "push ecx",
            "lea edx, [esp + 4]",
            "push edx",
            "call eax",
            "add esp, 8",
            "add esp, 36",
            "ret",
        )
    }

    let mut ctx = Ctx {
        f: Some(f),
        result: Err(Error::Internal),
    };
    unsafe {
        capture_raw(&mut ctx as *mut Ctx<F> as *mut c_void, stage2::<F>);
    }
    ctx.result
}

#[cfg(target_arch = "arm")]
pub fn with_current_thread_state<F>(f: F) -> Result<(), Error>
where
    F: FnOnce(&ThreadState) -> Result<(), Error>,
{
    use core::ffi::c_void;

    struct Ctx<F> {
        f: Option<F>,
        result: Result<(), Error>,
    }

    extern "C" fn stage2<F>(regs: *const u32, ctx: *mut c_void)
    where
        F: FnOnce(&ThreadState) -> Result<(), Error>,
    {
        let ctx = unsafe { &mut *(ctx as *mut Ctx<F>) };
        let mut state = ThreadState::new(Arch::Arm);
        for reg in 0..arm::REG_COUNT {
            state.set(reg as u8, unsafe { *regs.add(reg) } as u64);
        }
        ctx.result = match ctx.f.take() {
            Some(f) => f(&state),
            None => Err(Error::Internal),
        };
    }

    // Buffer layout: r0..r12 sp lr pc. bl does not push, so the entry sp is
    // the caller's sp and the captured pc is lr.
    #[unsafe(naked)]
    unsafe extern "C" fn capture_raw(
        ctx: *mut c_void,
        stage2: extern "C" fn(*const u32, *mut c_void),
    ) {
        core::arch::naked_asm!(
            "sub sp, sp, #64",
            "stm sp, {{r0-r12}}",
            "add r3, sp, #64",
            "str r3, [sp, #52]",
            "str lr, [sp, #56]",
            "str lr, [sp, #60]",
            "mov r2, r0",
            "mov r12, r1",
            "mov r0, sp",
            "mov r1, r2",
            "blx r12",
            "ldr lr, [sp, #56]",
            "add sp, sp, #64",
            "bx lr",
        )
    }

    let mut ctx = Ctx {
        f: Some(f),
        result: Err(Error::Internal),
    };
    unsafe {
        capture_raw(&mut ctx as *mut Ctx<F> as *mut c_void, stage2::<F>);
    }
    ctx.result
}

/// Live capture is only implemented for the targets we unwind; elsewhere the
/// caller has to construct states from a `ucontext` or by hand.
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "arm")))]
pub fn with_current_thread_state<F>(_f: F) -> Result<(), Error>
where
    F: FnOnce(&ThreadState) -> Result<(), Error>,
{
    Err(Error::Internal)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validity_bitmap() {
        let mut state = ThreadState::new(Arch::X86_64);
        assert_eq!(state.get(x86_64::RBX), Err(Error::NotFound));
        assert!(!state.has(x86_64::RBX));

        state.set(x86_64::RBX, 0x1234);
        assert!(state.has(x86_64::RBX));
        assert_eq!(state.get(x86_64::RBX), Ok(0x1234));

        // Out-of-range registers read as not-found and writes are ignored.
        assert_eq!(state.get(40), Err(Error::NotFound));
        state.set(40, 1);
        assert!(!state.has(40));
    }

    #[test]
    fn clear_volatile_keeps_only_callee_saved() {
        let mut state = ThreadState::new(Arch::X86_64);
        for reg in 0..x86_64::REG_COUNT as u8 {
            state.set(reg, reg as u64);
        }
        state.clear_volatile();

        for &reg in &[x86_64::RBX, x86_64::R12, x86_64::R13, x86_64::R14, x86_64::R15] {
            assert!(state.has(reg));
        }
        assert!(state.has(x86_64::RBP));
        assert!(state.has(x86_64::RSP));
        assert!(state.has(x86_64::RIP));
        for &reg in &[x86_64::RAX, x86_64::RCX, x86_64::RDX, x86_64::RDI, x86_64::RSI, x86_64::R10] {
            assert!(!state.has(reg));
        }
    }

    #[test]
    fn arm_volatile_set() {
        let mut state = ThreadState::new(Arch::Arm);
        for reg in 0..arm::REG_COUNT as u8 {
            state.set(reg, 0x100 + reg as u64);
        }
        state.clear_volatile();
        for &reg in &[arm::R4, arm::R5, arm::R6, arm::R7, arm::R8, arm::R10, arm::R11] {
            assert!(state.has(reg));
        }
        for &reg in &[arm::R0, arm::R9, arm::R12, arm::SP, arm::LR, arm::PC] {
            assert!(!state.has(reg));
        }
    }

    #[test]
    fn dwarf_mapping_round_trips() {
        for arch in [Arch::X86, Arch::X86_64, Arch::Arm] {
            for reg in 0..arch.reg_count() as u8 {
                let dwarf = arch.reg_to_dwarf(reg).unwrap();
                assert_eq!(arch.reg_from_dwarf(dwarf), Some(reg));
            }
        }
        // Darwin eh_frame swaps the i386 frame registers.
        assert_eq!(Arch::X86.reg_from_dwarf(4), Some(x86::EBP));
        assert_eq!(Arch::X86.reg_from_dwarf(5), Some(x86::ESP));
        // x86_64 column 16 is the return address.
        assert_eq!(Arch::X86_64.reg_from_dwarf(16), Some(x86_64::RIP));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn capture_reports_a_plausible_frame() {
        let mut seen = None;
        with_current_thread_state(|state| {
            seen = Some((state.ip()?, state.sp()?));
            Ok(())
        })
        .unwrap();
        let (ip, sp) = seen.unwrap();
        assert_ne!(ip, 0);
        assert_ne!(sp, 0);
        // The captured sp must be the caller-side sp, which encloses this
        // test frame's locals.
        let local = &mut 0u64 as *mut u64 as u64;
        assert!(sp > local);
    }
}
