// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv{6,7,8}-M.
//!
//! # ARM-M timer
//!
//! We use the system tick timer as the kernel timer. It's only suitable for
//! producing periodic interrupts, which is all the scheduler asks of it: each
//! SysTick interrupt is one kernel tick.
//!
//! # Notes on ARM-M interrupts
//!
//! This implementation uses several different interrupt service routines:
//!
//! - `SVCall` implements the `SVC` instruction used to make traps.
//! - `SysTick` handles interrupts from the System Tick Timer.
//! - `PendSV` handles deferred context switches from interrupts.
//!
//! On any interrupt, the processor stacks a small subset of machine state (the
//! exception frame) on the interrupted task's stack and then calls our ISR.
//! That's enough to resume the same code later, but not enough to resume
//! *different* code, and it doesn't give us the trap arguments, which live in
//! callee-save registers.
//!
//! So `SVCall` and `PendSV` push the rest of the task's registers onto the
//! same stack, just below the exception frame, and hand the resulting stack
//! pointer to the kernel. The kernel answers with the stack pointer of the
//! context to restore, which may belong to a different task, and the handler
//! pops registers from there and returns through whatever `EXC_RETURN` value
//! it finds. The register block is the `SavedContext` type below; a task that
//! isn't running is fully described by where its `SavedContext` lives.
//!
//! `SysTick` does *not* do the full save and restore, because most ticks
//! don't change which task runs. If one does, it pends `PendSV`, which runs
//! after `SysTick` returns and does the switch.
//!
//! All three run at the same (lowest) priority, so the kernel is never
//! preempted by itself. The configurable faults run above them.

use core::arch::{self, global_asm};
#[cfg(armv6m)]
use core::sync::atomic::{AtomicBool, Ordering};

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[cfg(any(armv7m, armv8m))]
use abi::{FaultInfo, Sysnum};

use crate::fail::die;
use crate::startup::with_kernel;
use crate::task::{ArchState, NextTask};

/// Thumb bit; the only thing a fresh task needs in its PSR.
const INITIAL_PSR: u32 = 1 << 24;

/// Initial FPSCR: round-to-nearest, no exceptions.
#[cfg(any(armv7m, armv8m))]
const INITIAL_FPSCR: u32 = 0;

// Return to Thread mode on the process stack. On parts with an FPU, bit 4 is
// clear, meaning the frame has FP state in it; the initial frame below does.
cfg_if::cfg_if! {
    if #[cfg(any(armv7m, armv8m))] {
        const EXC_RETURN_CONST: u32 = 0xFFFFFFED;
    } else if #[cfg(armv6m)] {
        const EXC_RETURN_CONST: u32 = 0xFFFFFFFD;
    } else {
        compile_error!("missing EXC_RETURN for ARM profile");
    }
}

/// Registers the hardware stacks on exception entry.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
    #[cfg(any(armv7m, armv8m))]
    pub fpu_regs: [u32; 16],
    #[cfg(any(armv7m, armv8m))]
    pub fpscr: u32,
    #[cfg(any(armv7m, armv8m))]
    pub reserved: u32,
}

impl ExceptionFrame {
    pub fn initial(entry: usize, exit: usize) -> Self {
        Self {
            lr: exit as u32,
            pc: entry as u32 & !1,
            xpsr: INITIAL_PSR,
            #[cfg(any(armv7m, armv8m))]
            fpscr: INITIAL_FPSCR,
            ..Self::default()
        }
    }
}

/// Registers the entry sequences save below the exception frame, lowest
/// address first. The layout is fixed by the `stm`/`ldm` sequences in this
/// file.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SavedContext {
    #[cfg(any(armv7m, armv8m))]
    s16_s31: [u32; 16],
    /// Whatever was in r3; it's only here to keep the block 8-byte sized.
    pad: u32,
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    exc_return: u32,
}

impl SavedContext {
    pub fn initial() -> Self {
        Self {
            exc_return: EXC_RETURN_CONST,
            ..Self::default()
        }
    }
}

impl ArchState for SavedContext {
    fn arg0(&self) -> usize {
        self.r4 as usize
    }
    fn arg1(&self) -> usize {
        self.r5 as usize
    }
    fn arg2(&self) -> usize {
        self.r6 as usize
    }
    fn arg3(&self) -> usize {
        self.r7 as usize
    }
    fn arg4(&self) -> usize {
        self.r8 as usize
    }
    fn arg5(&self) -> usize {
        self.r9 as usize
    }
    fn arg6(&self) -> usize {
        self.r10 as usize
    }

    fn ret0(&mut self, x: usize) {
        self.r4 = x as u32
    }
    fn ret1(&mut self, x: usize) {
        self.r5 = x as u32
    }
    fn ret2(&mut self, x: usize) {
        self.r6 = x as u32
    }
}

/// Sets up the exception priorities and the tick timer, then drops into
/// unprivileged Thread mode and makes the boot trap, which starts the first
/// task.
pub fn start_first_task(tick_divisor: u32) -> ! {
    // Enable faults and set fault/exception priorities to reasonable settings.
    // Our goal here is to keep the kernel non-preemptive, which means the
    // kernel entry points (SVCall, PendSV, SysTick, interrupt handlers) must be
    // at one priority level. Fault handlers need to be higher priority,
    // however, so that we can detect faults in the kernel.
    //
    // Safety: we're purely lowering priorities from their defaults, so it
    // can't cause any surprise preemption. But these operations are `unsafe`
    // in the `cortex_m` crate.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Faults on, on the processors that distinguish faults. This
        // distinguishes the following faults from HardFault:
        //
        // - ARMv7+: MEMFAULT, BUSFAULT, USGFAULT
        // - ARMv8: SECUREFAULT
        cfg_if::cfg_if! {
            if #[cfg(armv7m)] {
                scb.shcsr.modify(|x| x | 0b111 << 16);
            } else if #[cfg(armv8m)] {
                scb.shcsr.modify(|x| x | 0b1111 << 16);
            } else if #[cfg(armv6m)] {
                // This facility is missing.
            } else {
                compile_error!("missing fault setup for ARM profile");
            }
        }

        cfg_if::cfg_if! {
            if #[cfg(armv6m)] {
                // ARMv6 only has 4 priority levels and no configurable fault
                // priorities. Set priorities of SVCall, SysTick and PendSV to 3
                // (the lowest configurable).
                scb.shpr[0].modify(|x| x | 0b11 << 30);
                scb.shpr[1].modify(|x| x | 0b11 << 22 | 0b11 << 30);
            } else if #[cfg(any(armv7m, armv8m))] {
                // Usage, Bus, MemManage at 0 (highest configurable).
                scb.shpr[0].write(0x00);
                scb.shpr[1].write(0x00);
                scb.shpr[2].write(0x00);
                // SVCall, SysTick and PendSV at 0xFF (lowest configurable).
                scb.shpr[7].write(0xFF);
                scb.shpr[10].write(0xFF);
                scb.shpr[11].write(0xFF);
            } else {
                compile_error!("missing fault priorities for ARM profile");
            }
        }

        #[cfg(any(armv7m, armv8m))]
        {
            // Division by zero returns 0 unless we ask for a trap. Ask.
            const DIV_0_TRP: u32 = 1 << 4;
            scb.ccr.modify(|x| x | DIV_0_TRP);
        }

        // External interrupts must not preempt the kernel either.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        cfg_if::cfg_if! {
            if #[cfg(armv6m)] {
                // Eight 32-bit IPR registers, four priorities each, of which
                // only bits [7:6] are implemented. Writing all ones selects the
                // lowest priority everywhere. (The IPR registers on ARMv6-M
                // are 32 bits wide, whatever `cortex_m` suggests.)
                for i in 0..8 {
                    nvic.ipr[i].write(0xFFFF_FFFF);
                }
            } else if #[cfg(any(armv7m, armv8m))] {
                // ICTR gives the interrupt count in blocks of 32, minus 1.
                let icb = &*cortex_m::peripheral::ICB::PTR;
                let irq_count = ((icb.ictr.read() as usize & 0xF) + 1) * 32;
                for i in 0..irq_count {
                    nvic.ipr[i].write(0xFFu8);
                }
            } else {
                compile_error!("missing IRQ priorities for ARM profile");
            }
        }
    }

    // Safety: this, too, is safe in practice but unsafe in API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(tick_divisor - 1);
        syst.cvr.write(0);
        // Enable counter and interrupt, clocked from the core.
        syst.csr.modify(|v| v | 0b111);
    }

    // Our goal here is to get into Handler mode with Thread mode set up as
    // unprivileged and running off the Process Stack Pointer. The easiest way
    // to do this on ARM-M is to become that Thread mode and trap: the trap
    // handler recognizes the first trap as the boot trap.
    //
    // The process stack starts where the main stack is now, and the main stack
    // moves down to leave the boot trap room for its frame. Neither is used
    // again once the first task is running.
    //
    // Safety: this never returns to Rust, and leaves no Rust state pointing
    // at either stack.
    unsafe {
        arch::asm!(
            "
            mrs r0, MSP
            msr PSP, r0
            @ Thread mode on PSP, still privileged.
            movs r1, #2
            msr CONTROL, r1
            isb
            @ Keep 512 bytes for the boot trap's frame.
            movs r1, #2
            lsls r1, r1, #8
            subs r0, r0, r1
            msr MSP, r0
            @ Drop privilege.
            movs r1, #3
            msr CONTROL, r1
            isb
            @ Trap 0 from an unregistered caller: the boot trap.
            movs r0, #0
            mov r11, r0
            svc #0
            ",
            options(noreturn),
        )
    }
}

// Handler that gets linked into the vector table for the Supervisor Call (SVC)
// instruction. (Name is dictated by the `cortex_m` crate.)
//
// The registers the hardware didn't stack are pushed onto the process stack
// below the exception frame, in `SavedContext` order. The resulting stack
// pointer goes to `syscall_entry` along with the trap number from r11, and
// whatever it returns is where we pop the next context from.
cfg_if::cfg_if! {
    if #[cfg(armv6m)] {
        global_asm!{"
            .section .text.SVCall
            .globl SVCall
            .type SVCall,function
            SVCall:
                mrs r0, PSP
                subs r0, #40
                movs r1, r0
                @ pad and the low registers first,
                stm r1!, {{r3-r7}}
                @ then the high ones by way of the low ones.
                mov r3, r8
                mov r4, r9
                mov r5, r10
                mov r6, r11
                mov r7, lr
                stm r1!, {{r3-r7}}

                mov r1, r11
                bl syscall_entry

                @ r0 is the context to resume, possibly another task's.
                movs r1, r0
                adds r1, #20
                ldm r1!, {{r3-r7}}
                mov r8, r3
                mov r9, r4
                mov r10, r5
                mov r11, r6
                mov lr, r7
                ldm r0!, {{r3-r7}}
                adds r0, #20
                msr PSP, r0

                bx lr
            ",
        }
    } else if #[cfg(any(armv7m, armv8m))] {
        global_asm!{"
            .section .text.SVCall
            .globl SVCall
            .type SVCall,function
            SVCall:
                mrs r0, PSP
                stmdb r0!, {{r3-r11, lr}}
                vstmdb r0!, {{s16-s31}}

                mov r1, r11
                bl syscall_entry

                @ r0 is the context to resume, possibly another task's.
                vldmia r0!, {{s16-s31}}
                ldmia r0!, {{r3-r11, lr}}
                msr PSP, r0

                bx lr
            ",
        }
    } else {
        compile_error!("missing SVCall impl for ARM profile.");
    }
}

/// Rust side of the `SVCall` handler.
///
/// # Safety
///
/// Only the `SVCall` assembly calls this, with `ctx` pointing at the context
/// it just saved.
#[no_mangle]
unsafe extern "C" fn syscall_entry(ctx: u32, nr: u32) -> u32 {
    #[cfg(armv6m)]
    if PHANTOM_SVC.load(Ordering::Relaxed) {
        // This SVC was left pending by a task that faulted while making it.
        // `ctx` belongs to whoever we switched to after the fault; hand it
        // straight back.
        PHANTOM_SVC.store(false, Ordering::Relaxed);
        return ctx;
    }

    crate::profiling::trap_enter(nr);
    let next = with_kernel(|k| {
        k.switch_away(ctx as usize, |k| crate::syscalls::handle_trap(k, nr))
    });
    crate::profiling::trap_exit();
    next as u32
}

/// Handler that gets linked into the vector table for the System Tick Timer
/// overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::profiling::tick_enter();
    // If any periodic task woke, defer the context switch, because the entry
    // sequence to this ISR doesn't save enough state to switch here.
    if with_kernel(|k| k.tick()) != NextTask::Same {
        cortex_m::peripheral::SCB::set_pendsv();
    }
    crate::profiling::tick_exit();
}

// PendSV saves and restores exactly like SVCall.
cfg_if::cfg_if! {
    if #[cfg(armv6m)] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, PSP
                subs r0, #40
                movs r1, r0
                stm r1!, {{r3-r7}}
                mov r3, r8
                mov r4, r9
                mov r5, r10
                mov r6, r11
                mov r7, lr
                stm r1!, {{r3-r7}}

                bl pendsv_entry

                movs r1, r0
                adds r1, #20
                ldm r1!, {{r3-r7}}
                mov r8, r3
                mov r9, r4
                mov r10, r5
                mov r11, r6
                mov lr, r7
                ldm r0!, {{r3-r7}}
                adds r0, #20
                msr PSP, r0

                bx lr
            ",
        }
    } else if #[cfg(any(armv7m, armv8m))] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, PSP
                stmdb r0!, {{r3-r11, lr}}
                vstmdb r0!, {{s16-s31}}

                bl pendsv_entry

                vldmia r0!, {{s16-s31}}
                ldmia r0!, {{r3-r11, lr}}
                msr PSP, r0

                bx lr
            ",
        }
    } else {
        compile_error!("missing PendSV impl for ARM profile.");
    }
}

/// The Rust side of the PendSV handler, after all volatile registers have been
/// saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry(ctx: u32) -> u32 {
    crate::profiling::switch_enter();
    let next = with_kernel(|k| k.switch_away(ctx as usize, |_| NextTask::Other));
    crate::profiling::switch_exit();
    next as u32
}

// Task side of a trap: `kern_trap(nr, args, rets)` loads the trap number into
// r11 and the arguments into r4-r10, traps, and stores r4-r6 into `rets`.
cfg_if::cfg_if! {
    if #[cfg(armv6m)] {
        global_asm!{"
            .section .text.kern_trap
            .globl kern_trap
            .type kern_trap,function
            kern_trap:
                push {{r4-r7, lr}}
                mov r4, r8
                mov r5, r9
                mov r6, r10
                mov r7, r11
                push {{r4-r7}}
                push {{r2}}

                mov r11, r0
                ldr r3, [r1, #16]
                mov r8, r3
                ldr r3, [r1, #20]
                mov r9, r3
                ldr r3, [r1, #24]
                mov r10, r3
                ldm r1!, {{r4-r7}}
                svc #0

                pop {{r2}}
                stm r2!, {{r4-r6}}
                pop {{r4-r7}}
                mov r8, r4
                mov r9, r5
                mov r10, r6
                mov r11, r7
                pop {{r4-r7, pc}}
            ",
        }
    } else if #[cfg(any(armv7m, armv8m))] {
        global_asm!{"
            .section .text.kern_trap
            .globl kern_trap
            .type kern_trap,function
            kern_trap:
                push {{r4-r11, lr}}
                push {{r2}}
                mov r11, r0
                ldm r1, {{r4-r10}}
                svc #0
                pop {{r2}}
                stm r2, {{r4-r6}}
                pop {{r4-r11, pc}}
            ",
        }
    } else {
        compile_error!("missing trap stub for ARM profile.");
    }
}

extern "C" {
    fn kern_trap(nr: u32, args: *const [u32; 7], rets: *mut [u32; 3]);
}

/// Makes trap `nr` from task code.
pub fn trap(nr: Sysnum, args: &[usize; 7]) -> [usize; 3] {
    let args = args.map(|a| a as u32);
    let mut rets = [0u32; 3];
    // Safety: `kern_trap` preserves every callee-save register and only
    // touches the two arrays we hand it.
    unsafe {
        kern_trap(nr as u32, &args, &mut rets);
    }
    rets.map(|r| r as usize)
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Set when a task faults with its SVC still pending, so the SVC that fires
/// after the fault handler returns can be ignored.
///
/// ARMv6-M's SHCSR would let us clear the pending SVC directly, but on the
/// Cortex-M0+ it reads as zero from the processor, so we detect the pending
/// SVC in ICSR and swallow it on arrival instead.
#[cfg(armv6m)]
static PHANTOM_SVC: AtomicBool = AtomicBool::new(false);

#[cfg(any(armv7m, armv8m))]
global_asm! {"
    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    .cpu cortex-m4  @ least common denominator we support
    configurable_fault:
        @ The faulting task is about to be ended, so its registers aren't
        @ saved. Touching the FP registers here could also trigger a lazy
        @ FP save onto a stack that may be the reason we're here.
        mov r0, lr
        @ The exception number is the bottom 9 bits of IPSR, but this handler
        @ only serves exceptions below 16.
        mrs r1, IPSR
        and r1, r1, #0xf
        bl fault_entry

        @ r0 is the context of the task to run instead.
        vldmia r0!, {{s16-s31}}
        ldmia r0!, {{r3-r11, lr}}
        msr PSP, r0

        bx lr

    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b configurable_fault

    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
        mov r0, lr
        bl hard_fault_entry
    ",
}

#[cfg(armv6m)]
global_asm! {"
    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
        mov r0, lr
        bl fault_entry

        movs r1, r0
        adds r1, #20
        ldm r1!, {{r3-r7}}
        mov r8, r3
        mov r9, r4
        mov r10, r5
        mov r11, r6
        mov lr, r7
        ldm r0!, {{r3-r7}}
        adds r0, #20
        msr PSP, r0

        bx lr
    ",
}

#[cfg(any(armv7m, armv8m))]
#[derive(Copy, Clone, Debug)]
#[repr(u32)]
enum FaultType {
    MemoryManagement = 4,
    BusFault = 5,
    UsageFault = 6,
}

#[cfg(any(armv7m, armv8m))]
bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[repr(transparent)]
    struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        // MMFSR bit 2 reserved
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        // MMFSR bit 6 reserved
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        // BFSR bit 6 reserved
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);

        #[cfg(armv8m)]
        const STKOF = 1 << (16 + 4);

        // UFSR bits 4-7 reserved on ARMv7-M -- 5-7 on ARMv8-M
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);

        // UFSR bits 10-31 reserved
    }
}

/// Whether an exception was taken from Thread mode on the process stack,
/// i.e. from a task rather than the kernel or the boot sequence.
fn from_task(exc_return: u32) -> bool {
    exc_return & 0b1100 == 0b1100
}

/// Rust entry point for the configurable faults. Ends the faulting task and
/// returns the context to run instead.
///
/// # Safety
///
/// Only the fault handler assembly calls this.
#[no_mangle]
#[cfg(any(armv7m, armv8m))]
unsafe extern "C" fn fault_entry(exc_return: u32, fault_type: u32) -> u32 {
    // Safety: shared reference to a static-scoped Sync thing; the cortex_m
    // crate just doesn't have a safe way to say so.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());

    if !from_task(exc_return) {
        die(format_args!(
            "kernel fault {fault_type}: CFSR={:#010x}, MMFAR={:#010x}, \
             BFAR={:#010x}",
            cfsr.bits(),
            scb.mmfar.read(),
            scb.bfar.read(),
        ));
    }

    // A fault taken while stacking for another exception (a trap with no
    // room on the stack, say) leaves that exception pending, and it would
    // fire on whatever task we switch to. The pended bits for the
    // architectural exceptions are SHCSR 15:12; clear them all.
    //
    // Safety: SVC isn't higher priority than this handler, which is the only
    // hazard the ARMv7-M ARM suggests for this write.
    unsafe {
        scb.shcsr.modify(|bits| bits & !(0b1111 << 12));
    }

    let psp = cortex_m::register::psp::read();
    let fault_type = match fault_type {
        4 => FaultType::MemoryManagement,
        5 => FaultType::BusFault,
        6 => FaultType::UsageFault,
        n => die(format_args!("fault handler entered for exception {n}")),
    };
    let (fault, stackinvalid) = match fault_type {
        FaultType::MemoryManagement => {
            if cfsr.contains(Cfsr::MSTKERR) {
                // The stack pointer is so trashed we can't store through it,
                // which is about all we know.
                (FaultInfo::StackOverflow { address: psp }, true)
            } else {
                (
                    FaultInfo::MemoryAccess {
                        address: if cfsr.contains(Cfsr::MMARVALID)
                            && !cfsr.contains(Cfsr::IACCVIOL)
                        {
                            Some(scb.mmfar.read())
                        } else {
                            None
                        },
                    },
                    false,
                )
            }
        }

        FaultType::BusFault => (
            FaultInfo::BusError {
                address: if cfsr.contains(Cfsr::BFARVALID) {
                    Some(scb.bfar.read())
                } else {
                    None
                },
            },
            cfsr.contains(Cfsr::STKERR),
        ),

        FaultType::UsageFault => {
            #[cfg(armv8m)]
            if cfsr.contains(Cfsr::STKOF) {
                return end_faulting_task(FaultInfo::StackOverflow {
                    address: psp,
                });
            }
            (
                if cfsr.contains(Cfsr::DIVBYZERO) {
                    FaultInfo::DivideByZero
                } else if cfsr.contains(Cfsr::UNDEFINSTR) {
                    FaultInfo::IllegalInstruction
                } else {
                    FaultInfo::InvalidOperation(cfsr.bits())
                },
                false,
            )
        }
    };

    // CFSR is write-one-to-clear, and clearing it is our job.
    //
    // Safety: it is not at _all_ clear why its write function is unsafe.
    unsafe {
        scb.cfsr.write(cfsr.bits());
    }

    if stackinvalid {
        // Keep the FP unit from lazily stacking the dead task's registers
        // through its broken stack pointer.
        const LSPACT: u32 = 1 << 0;
        // Safety: only affects the pending lazy save we want gone.
        unsafe {
            let fpu = &*cortex_m::peripheral::FPU::PTR;
            fpu.fpccr.modify(|x| x & !LSPACT);
        }
    }

    end_faulting_task(fault)
}

/// Rust entry point for HardFault on ARMv6-M, which has no other faults. It
/// also doesn't say what went wrong.
///
/// # Safety
///
/// Only the fault handler assembly calls this.
#[no_mangle]
#[cfg(armv6m)]
unsafe extern "C" fn fault_entry(exc_return: u32) -> u32 {
    if !from_task(exc_return) {
        die("kernel fault");
    }

    // If the task faulted while stacking for an SVC, that SVC is still
    // pending (VECTPENDING is 11) and arrives as soon as we return.
    //
    // Safety: shared reference to a static-scoped Sync thing.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    // VECTPENDING is 9 bits, but ARMv6-M has no more than 48 exceptions.
    let vectpending = (scb.icsr.read() >> 12) as u8;
    if vectpending == 11 {
        PHANTOM_SVC.store(true, Ordering::Relaxed);
    }

    end_faulting_task(FaultInfo::InvalidOperation(0))
}

fn end_faulting_task(fault: FaultInfo) -> u32 {
    with_kernel(|k| k.fault_away(fault)) as u32
}

/// Rust entry point for HardFault on parts with configurable faults, where
/// it means a fault while handling a fault, or something equally fatal.
#[no_mangle]
#[cfg(any(armv7m, armv8m))]
extern "C" fn hard_fault_entry(exc_return: u32) -> ! {
    // Safety: shared reference to a static-scoped Sync thing.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    die(format_args!(
        "hard fault: EXC_RETURN={exc_return:#010x}, HFSR={:#010x}, \
         CFSR={:#010x}",
        scb.hfsr.read(),
        scb.cfsr.read(),
    ))
}
