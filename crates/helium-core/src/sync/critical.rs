//! Critical-section and interrupt-masking guards.
//!
//! [`ScopedCritical`] marks a region where the scheduler must not preempt
//! the current thread: it bumps the per-CPU critical depth and drops it on
//! scope exit. Interrupts stay enabled.
//!
//! [`InterruptDisabler`] additionally masks hardware interrupt delivery.
//! Nesting is tracked on the [`Processor`] record: the flags are saved by
//! the outermost guard and restored only when it drops, so any interleaving
//! with `Spinlock`'s own masking is safe.
//!
//! Both guards are `!Send`; they describe the state of the CPU they were
//! created on.

use core::marker::PhantomData;

use crate::arch;
use crate::processor::Processor;

/// RAII guard deferring preemption on the current CPU.
#[must_use = "preemption is re-enabled as soon as the guard is dropped"]
pub struct ScopedCritical<'a> {
    proc: &'a Processor,
    _not_send: PhantomData<*mut ()>,
}

impl ScopedCritical<'static> {
    /// Enters a critical section on the calling CPU.
    pub fn new() -> Self {
        Self::for_processor(Processor::current())
    }
}

impl Default for ScopedCritical<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ScopedCritical<'a> {
    /// Enters a critical section on an explicit processor record.
    ///
    /// Exists for deterministic tests; kernel code uses
    /// [`ScopedCritical::new`].
    pub fn for_processor(proc: &'a Processor) -> Self {
        proc.enter_critical();
        Self {
            proc,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ScopedCritical<'_> {
    fn drop(&mut self) {
        self.proc.leave_critical();
    }
}

/// RAII guard masking hardware interrupt delivery on the current CPU.
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct InterruptDisabler<'a> {
    proc: &'a Processor,
    _not_send: PhantomData<*mut ()>,
}

impl InterruptDisabler<'static> {
    /// Masks interrupts on the calling CPU until the guard drops.
    pub fn new() -> Self {
        Self::for_processor(Processor::current())
    }
}

impl Default for InterruptDisabler<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> InterruptDisabler<'a> {
    /// Masks interrupts, tracking nesting on an explicit processor record.
    pub fn for_processor(proc: &'a Processor) -> Self {
        let flags = arch::save_and_disable_interrupts();
        proc.enter_irq_disable(flags);
        Self {
            proc,
            _not_send: PhantomData,
        }
    }
}

impl Drop for InterruptDisabler<'_> {
    fn drop(&mut self) {
        // Only the outermost guard gets the saved flags back.
        if let Some(saved) = self.proc.leave_irq_disable() {
            arch::restore_interrupts(saved);
        }
    }
}
