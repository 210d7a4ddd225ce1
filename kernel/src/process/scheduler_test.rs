//! Scheduler behavior: fairness, preemption accounting, EDF admission,
//! idle fallback, CR3 switching.

use crate::arch::TrapFrame;
use crate::process::scheduler::Scheduler;
use crate::process::{Task, TaskState};
use crate::selftest::{self, boot_with_init, syscall};
use crate::sync::SpinLock;
use osmium_abi::Sysno;

/// Drive a private scheduler for `ticks` timer interrupts.
fn run_ticks(
    sched: &mut Scheduler,
    memory: &SpinLock<crate::memory::PhysicalMemory>,
    frame: &mut TrapFrame,
    start: u64,
    ticks: u64,
) {
    for tick in 0..ticks {
        let now = start + tick + 1;
        sched.on_tick(now);
        sched.run(now, frame, memory);
    }
}

fn bare_machine() -> SpinLock<crate::memory::PhysicalMemory> {
    SpinLock::new(crate::memory::PhysicalMemory::new(selftest::boot_info()))
}

#[test]
fn two_equal_tasks_split_the_cpu_evenly() {
    let memory = bare_machine();
    let mut sched = Scheduler::new();
    for pid in [1u32, 2u32] {
        sched.insert_task(Task::alloc(None, pid, 0, 0));
        sched.enqueue_task(pid);
    }

    let mut frame = TrapFrame::new_user();
    const N: u64 = 100;
    run_ticks(&mut sched, &memory, &mut frame, 0, N);

    // The tick still running when we stop is not yet accounted.
    let a = sched.task(1).unwrap().se.sum_exec_runtime;
    let b = sched.task(2).unwrap().se.sum_exec_runtime;
    assert_eq!(a + b, N - 1);
    assert!(
        a.abs_diff(b) <= 1,
        "fairness violated: {} vs {} over {} ticks",
        a,
        b,
        N
    );
}

#[test]
fn periodic_tasks_preempt_fair_ones_by_deadline() {
    let memory = bare_machine();
    let mut sched = Scheduler::new();
    for pid in [1u32, 2u32, 3u32] {
        sched.insert_task(Task::alloc(None, pid, 0, 0));
    }
    sched.enqueue_task(1);
    // Two periodic tasks with different deadlines.
    sched.set_periodic(2, 100, 10, 0).unwrap();
    sched.set_periodic(3, 50, 10, 0).unwrap();
    sched.enqueue_task(2);
    sched.enqueue_task(3);

    let mut frame = TrapFrame::new_user();
    sched.run(1, &mut frame, &memory);
    // Earliest absolute deadline first: pid 3 (deadline 50).
    assert_eq!(sched.current_pid(), Some(3));
}

#[test]
fn edf_admission_respects_total_utilization() {
    let mut sched = Scheduler::new();
    for pid in 1..=4u32 {
        sched.insert_task(Task::alloc(None, pid, 0, 0));
    }
    // 0.5 + 0.4 fits; another 0.2 does not.
    sched.set_periodic(1, 10, 5, 0).unwrap();
    sched.set_periodic(2, 10, 4, 0).unwrap();
    assert_eq!(
        sched.set_periodic(3, 10, 2, 0),
        Err(osmium_abi::Errno::Again)
    );
    // Exactly filling the remaining 0.1 is admitted.
    sched.set_periodic(4, 10, 1, 0).unwrap();
    assert_eq!(sched.periodic_utilization_ppm(), 1_000_000);
}

#[test]
fn sleeping_tasks_wake_on_their_tick() {
    let memory = bare_machine();
    let mut sched = Scheduler::new();
    for pid in [1u32, 2u32] {
        sched.insert_task(Task::alloc(None, pid, 0, 0));
        sched.enqueue_task(pid);
    }

    let mut frame = TrapFrame::new_user();
    sched.run(1, &mut frame, &memory);
    assert_eq!(sched.current_pid(), Some(1));
    sched.sleep_current(Some(5), false);
    sched.run(1, &mut frame, &memory);
    assert_eq!(sched.current_pid(), Some(2));

    run_ticks(&mut sched, &memory, &mut frame, 1, 3);
    assert_eq!(sched.task(1).unwrap().state, TaskState::Sleeping);
    run_ticks(&mut sched, &memory, &mut frame, 4, 2);
    // Tick 5 passed: task 1 is runnable again and, having slept, is
    // preferred by vruntime.
    assert_eq!(sched.task(1).unwrap().state, TaskState::Running);
}

#[test]
#[should_panic(expected = "no runnable task")]
fn empty_scheduler_panics() {
    let memory = bare_machine();
    let mut sched = Scheduler::new();
    let mut frame = TrapFrame::new_user();
    sched.run(1, &mut frame, &memory);
}

#[test]
fn idle_context_resumes_when_everyone_sleeps() {
    let memory = bare_machine();
    let mut sched = Scheduler::new();
    sched.insert_task(Task::alloc(None, 1, 0, 0));
    sched.enqueue_task(1);

    let mut idle = TrapFrame::new_user();
    idle.eip = 0xDEAD_BEE0;
    sched.set_idle_context(idle);

    let mut frame = TrapFrame::new_user();
    sched.run(1, &mut frame, &memory);
    sched.sleep_current(Some(100), false);
    sched.run(2, &mut frame, &memory);
    assert_eq!(frame.eip, 0xDEAD_BEE0);
    assert_eq!(sched.current_pid(), None);
}

#[test]
fn cr3_reloads_only_when_the_address_space_changes() {
    // Through the full kernel: init plus a forked child have different
    // directories; syscalls that keep the same task must not reload.
    let (kernel, mut frame) = boot_with_init();

    let loads_after_boot = kernel.sched.lock().cr3_loads;
    syscall(kernel, &mut frame, Sysno::Getpid, &[]);
    syscall(kernel, &mut frame, Sysno::Getpid, &[]);
    assert_eq!(kernel.sched.lock().cr3_loads, loads_after_boot);

    // Fork and bounce between parent and child: every actual task switch
    // reloads, same-task reschedules do not.
    syscall(kernel, &mut frame, Sysno::Fork, &[]);
    let after_fork = kernel.sched.lock().cr3_loads;
    // The parent resumed; the scheduler may or may not have reloaded
    // depending on pick order, but a sleep forces the child in.
    syscall(kernel, &mut frame, Sysno::Sleep, &[4]);
    let after_switch = kernel.sched.lock().cr3_loads;
    assert!(after_switch > after_fork, "switching tasks must reload CR3");
}

#[test]
fn exit_reparents_children_to_init() {
    let (kernel, mut frame) = boot_with_init();

    // init forks A; A forks B; A exits; B must become init's child.
    syscall(kernel, &mut frame, Sysno::Fork, &[]);
    let a = frame.eax;

    // Put init to sleep so A runs.
    syscall(kernel, &mut frame, Sysno::Sleep, &[50]);
    {
        let sched = kernel.sched.lock();
        assert_eq!(sched.current_pid(), Some(a));
    }
    syscall(kernel, &mut frame, Sysno::Fork, &[]);
    let b = frame.eax;

    // A exits; B is reparented and A stays a zombie until reaped.
    syscall(kernel, &mut frame, Sysno::Exit, &[0]);
    let sched = kernel.sched.lock();
    assert_eq!(sched.task(a).unwrap().state, TaskState::Zombie);
    assert_eq!(sched.task(b).unwrap().parent, 1);
    assert!(sched.task(1).unwrap().children.contains(&b));
}
