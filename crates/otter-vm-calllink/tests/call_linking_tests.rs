//! End-to-end call linking tests
//!
//! A `caller` function whose body is one call instruction is invoked from
//! the host with the callee as its first argument; the tests then inspect
//! the caller's call link info.

use std::cell::Cell;

use tracing_subscriber::filter::EnvFilter;

use otter_vm_calllink::{
    CallFrame, CallLinkConfig, CallLinkInfo, CallMode, CallSiteDescriptor, CallTarget, CallType, CellId,
    Executable, JitType, LinkMode, NativeEntry, RealmId, SpecializationKind, Value, Vm, VmResult,
};

thread_local! {
    static PREPARES: Cell<u32> = const { Cell::new(0) };
}

/// Route `otter::calllink` logs to the test output (`RUST_LOG=otter=debug`).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

/// Returns the function's first captured value.
fn return_capture(vm: &mut Vm, frame: &CallFrame) -> VmResult<Value> {
    Ok(vm
        .captures(frame.callee())
        .and_then(|captures| captures.first().copied())
        .unwrap_or_default())
}

fn return_capture_plus_1000(vm: &mut Vm, frame: &CallFrame) -> VmResult<Value> {
    let base = return_capture(vm, frame)?.as_int().unwrap_or(0);
    Ok(Value::Int(base + 1000))
}

/// Calls its first argument through site 0, forwarding the rest.
fn call_first_argument(vm: &mut Vm, frame: &CallFrame) -> VmResult<Value> {
    let rest: Vec<Value> = frame.arguments().iter().skip(1).copied().collect();
    vm.execute_call(frame, 0, frame.argument(0), Value::Undefined, &rest)
}

fn tail_call_first_argument(vm: &mut Vm, frame: &CallFrame) -> VmResult<Value> {
    vm.execute_tail_call(frame, 0, frame.argument(0), Value::Undefined, &[], || {
        PREPARES.with(|count| count.set(count.get() + 1));
    })
}

fn handler_returns_7(_vm: &mut Vm, _frame: &CallFrame) -> VmResult<Value> {
    Ok(Value::Int(7))
}

fn returns_undefined(_vm: &mut Vm, _frame: &CallFrame) -> VmResult<Value> {
    Ok(Value::Undefined)
}

struct Harness {
    vm: Vm,
    caller: CellId,
    caller_executable: CellId,
}

impl Harness {
    fn new(call_type: CallType) -> Self {
        Self::with_config(call_type, CallLinkConfig::default())
    }

    fn with_config(call_type: CallType, config: CallLinkConfig) -> Self {
        let entry: NativeEntry = if call_type.call_mode() == CallMode::Tail {
            tail_call_first_argument
        } else {
            call_first_argument
        };
        Self::with_executable(
            config,
            Executable::builder("caller", entry)
                .call_site(CallSiteDescriptor::new(call_type, 4))
                .build(),
        )
    }

    fn with_executable(config: CallLinkConfig, executable: Executable) -> Self {
        init_tracing();
        let mut vm = Vm::new(config).unwrap();
        let caller_executable = vm.allocate_executable(executable);
        let caller = vm.create_function(caller_executable).unwrap();
        vm.add_root(caller);
        Self {
            vm,
            caller,
            caller_executable,
        }
    }

    /// A function with its own executable returning `n`.
    fn callee(&mut self, n: i64) -> CellId {
        self.callee_in(n, RealmId::default())
    }

    fn callee_in(&mut self, n: i64, realm: RealmId) -> CellId {
        let executable = self
            .vm
            .allocate_executable(Executable::builder(format!("f{n}"), return_capture).build());
        self.vm
            .create_closure(executable, realm, vec![Value::Int(n)])
            .unwrap()
    }

    fn call(&mut self, callee: Value, rest: &[Value]) -> VmResult<Value> {
        let mut args = vec![callee];
        args.extend_from_slice(rest);
        self.vm.call(Value::Cell(self.caller), Value::Undefined, &args)
    }

    fn call_cell(&mut self, callee: CellId) -> i64 {
        self.call(Value::Cell(callee), &[])
            .unwrap()
            .as_int()
            .unwrap()
    }

    fn site(&self) -> &CallLinkInfo {
        let block = self
            .vm
            .code_block_for(self.caller_executable, SpecializationKind::Call)
            .expect("caller compiled");
        self.vm.call_link_info(block, 0).unwrap()
    }
}

#[test]
fn monomorphic_site_dispatches_cached_callee() {
    let mut h = Harness::new(CallType::Call);
    let a = h.callee(1);

    assert_eq!(h.call_cell(a), 1);
    assert_eq!(h.site().mode(), LinkMode::Monomorphic);
    assert_eq!(h.site().slow_path_count(), 1);

    for _ in 0..5 {
        assert_eq!(h.call_cell(a), 1);
    }
    assert_eq!(h.site().slow_path_count(), 1, "fast path must not relink");
    assert_eq!(h.vm.stats().fast_path_hits, 5);
}

#[test]
fn polymorphic_site_holds_exactly_the_observed_callees() {
    let mut h = Harness::new(CallType::Call);
    let callees: Vec<_> = (1..=3).map(|n| h.callee(n)).collect();

    for (n, callee) in callees.iter().enumerate() {
        assert_eq!(h.call_cell(*callee), n as i64 + 1);
    }
    assert_eq!(h.site().mode(), LinkMode::Polymorphic);
    assert_eq!(h.site().stub().map(|s| s.len()), Some(3));

    // Every cached callee now takes the stub fast path.
    let slow = h.site().slow_path_count();
    for (n, callee) in callees.iter().enumerate().rev() {
        assert_eq!(h.call_cell(*callee), n as i64 + 1);
    }
    assert_eq!(h.site().slow_path_count(), slow);

    let hits: Vec<u64> = h
        .site()
        .stub()
        .unwrap()
        .cases()
        .iter()
        .map(|case| case.hits())
        .collect();
    assert_eq!(hits, vec![1, 1, 1]);
}

#[test]
fn capacity_four_scenario() {
    let mut h = Harness::new(CallType::Call);
    let a = h.callee(1);
    let b = h.callee(2);
    let c = h.callee(3);
    let d = h.callee(4);
    let e = h.callee(5);

    let expected = [
        (a, 1, LinkMode::Monomorphic, None),
        (a, 1, LinkMode::Monomorphic, None),
        (a, 1, LinkMode::Monomorphic, None),
        (b, 2, LinkMode::Polymorphic, Some(2)),
        (c, 3, LinkMode::Polymorphic, Some(3)),
        (d, 4, LinkMode::Polymorphic, Some(4)),
        (e, 5, LinkMode::Virtual, None),
    ];
    for (step, (callee, value, mode, cases)) in expected.into_iter().enumerate() {
        assert_eq!(h.call_cell(callee), value, "step {step}");
        assert_eq!(h.site().mode(), mode, "step {step}");
        assert_eq!(h.site().stub().map(|s| s.len()), cases, "step {step}");
    }

    // A later call to A dispatches generically without relinking.
    let slow = h.site().slow_path_count();
    assert_eq!(h.call_cell(a), 1);
    assert_eq!(h.site().mode(), LinkMode::Virtual);
    assert_eq!(h.site().slow_path_count(), slow);
    assert!(h.site().cleared_by_virtual());

    let stats = h.vm.stats();
    assert_eq!(stats.monomorphic_links, 1);
    assert_eq!(stats.polymorphic_links, 1);
    assert_eq!(stats.stub_regenerations, 2);
    assert_eq!(stats.virtual_transitions, 1);
    assert_eq!(stats.virtual_calls, 1);
}

#[test]
fn overflow_respects_configured_capacity() {
    let config = CallLinkConfig {
        polymorphic_capacity: 2,
        ..Default::default()
    };
    let mut h = Harness::with_config(CallType::Call, config);
    for n in 1..=3 {
        let callee = h.callee(n);
        assert_eq!(h.call_cell(callee), n);
    }
    assert_eq!(h.site().mode(), LinkMode::Virtual);

    let late = h.callee(9);
    assert_eq!(h.call_cell(late), 9);
}

#[test]
fn non_callable_value_raises_type_error_and_site_stays_init() {
    let mut h = Harness::new(CallType::Call);

    let err = h.call(Value::Int(5), &[]).unwrap_err();
    assert!(err.is_type_error());
    assert!(err.to_string().contains("5 is not a function"));
    assert_eq!(h.site().mode(), LinkMode::Init);

    let object = h.vm.create_object();
    let err = h.call(Value::Cell(object), &[]).unwrap_err();
    assert!(err.is_type_error());
    assert_eq!(h.site().mode(), LinkMode::Init);
    assert!(h.site().site().target().is_slow_path());
    assert_eq!(h.vm.stats().type_errors, 2);
}

#[test]
fn callable_object_goes_virtual() {
    let mut h = Harness::new(CallType::Call);
    let object = h.vm.create_callable_object(handler_returns_7);

    assert_eq!(h.call_cell(object), 7);
    assert_eq!(h.site().mode(), LinkMode::Virtual);
    assert_eq!(h.call_cell(object), 7);
}

#[test]
fn cross_realm_callee_is_not_cached() {
    let mut h = Harness::new(CallType::Call);
    let foreign = h.callee_in(3, RealmId(1));

    assert_eq!(h.call_cell(foreign), 3);
    assert_eq!(h.site().mode(), LinkMode::Virtual);
}

#[test]
fn disabled_call_caching_goes_virtual() {
    let mut h = Harness::with_executable(
        CallLinkConfig::default(),
        Executable::builder("caller", call_first_argument)
            .call_site(CallSiteDescriptor::new(CallType::Call, 0))
            .without_call_caching()
            .build(),
    );
    let a = h.callee(1);
    assert_eq!(h.call_cell(a), 1);
    assert_eq!(h.site().mode(), LinkMode::Virtual);

    let config = CallLinkConfig {
        enable_call_caching: false,
        ..Default::default()
    };
    let mut h = Harness::with_config(CallType::Call, config);
    let a = h.callee(1);
    assert_eq!(h.call_cell(a), 1);
    assert_eq!(h.site().mode(), LinkMode::Virtual);
}

#[test]
fn closures_of_one_executable_share_a_stub_case() {
    let mut h = Harness::new(CallType::Call);
    let executable = h
        .vm
        .allocate_executable(Executable::builder("closure", return_capture).build());
    let closures: Vec<_> = (1..=5)
        .map(|n| {
            h.vm
                .create_closure(executable, RealmId::default(), vec![Value::Int(n)])
                .unwrap()
        })
        .collect();

    assert_eq!(h.call_cell(closures[0]), 1);
    assert_eq!(h.call_cell(closures[1]), 2);
    assert_eq!(h.site().mode(), LinkMode::Polymorphic);
    assert!(h.site().has_seen_closure());
    assert_eq!(h.site().stub().map(|s| s.len()), Some(1));

    // Further closures hit the closure case without the slow path.
    let slow = h.site().slow_path_count();
    for (n, closure) in closures.iter().enumerate().skip(2) {
        assert_eq!(h.call_cell(*closure), n as i64 + 1);
    }
    assert_eq!(h.site().slow_path_count(), slow);
}

#[test]
fn direct_call_skips_identity_check() {
    let mut h = Harness::new(CallType::DirectCall);
    let a = h.callee(1);
    let b = h.callee(2);

    assert_eq!(h.call_cell(a), 1);
    assert_eq!(h.site().mode(), LinkMode::LinkedDirect);
    assert_eq!(h.site().max_argument_count_including_this(), 1);
    assert!(matches!(h.site().site().target(), CallTarget::Direct(_)));

    // The target is fixed: another callee does not cause a miss.
    let slow = h.site().slow_path_count();
    let _ = h.call(Value::Cell(b), &[]).unwrap();
    assert_eq!(h.site().slow_path_count(), slow);
    assert_eq!(h.site().mode(), LinkMode::LinkedDirect);
}

#[test]
fn tail_call_prepares_once_per_resolution() {
    let mut h = Harness::new(CallType::TailCall);
    let a = h.callee(1);
    let b = h.callee(2);
    PREPARES.with(|count| count.set(0));

    assert_eq!(h.call_cell(a), 1);
    assert_eq!(PREPARES.with(Cell::get), 1);
    assert_eq!(h.call_cell(a), 1);
    assert_eq!(PREPARES.with(Cell::get), 2);
    assert_eq!(h.call_cell(b), 2);
    assert_eq!(PREPARES.with(Cell::get), 3);
    assert_eq!(h.site().mode(), LinkMode::Polymorphic);

    // No transfer, no prepare.
    assert!(h.call(Value::Int(0), &[]).is_err());
    assert_eq!(PREPARES.with(Cell::get), 3);
}

#[test]
fn tail_site_rejects_regular_execution() {
    fn regular_call_on_tail_site(vm: &mut Vm, frame: &CallFrame) -> VmResult<Value> {
        vm.execute_call(frame, 0, frame.argument(0), Value::Undefined, &[])
    }
    let mut h = Harness::with_executable(
        CallLinkConfig::default(),
        Executable::builder("caller", regular_call_on_tail_site)
            .call_site(CallSiteDescriptor::new(CallType::TailCall, 0))
            .build(),
    );
    let a = h.callee(1);
    let err = h.call(Value::Cell(a), &[]).unwrap_err();
    assert!(!err.is_type_error());
}

#[test]
fn construct_requires_constructor() {
    let mut h = Harness::new(CallType::Construct);
    let arrow = h
        .vm
        .allocate_executable(
            Executable::builder("arrow", returns_undefined)
                .not_constructible()
                .build(),
        );
    let arrow = h.vm.create_function(arrow).unwrap();

    let err = h.call(Value::Cell(arrow), &[]).unwrap_err();
    assert!(err.to_string().contains("arrow is not a constructor"));
    assert_eq!(h.site().mode(), LinkMode::Init);

    let class = h
        .vm
        .allocate_executable(Executable::builder("Point", returns_undefined).build());
    let class = h.vm.create_function(class).unwrap();
    let object = h.call(Value::Cell(class), &[]).unwrap();
    assert!(object.as_cell().is_some(), "construct returns the new object");
    assert_eq!(h.site().mode(), LinkMode::Monomorphic);

    // The construct specialization was compiled, not the call one.
    let executable = h.vm.executable_of(class).unwrap();
    assert!(h.vm.code_block_for(executable, SpecializationKind::Construct).is_some());
    assert!(h.vm.code_block_for(executable, SpecializationKind::Call).is_none());
}

#[test]
fn varargs_profile_is_monotonic_and_capped() {
    let config = CallLinkConfig {
        max_varargs_argument_count: 16,
        ..Default::default()
    };
    let mut h = Harness::with_config(CallType::CallVarargs, config);
    let a = h.callee(1);

    h.call(Value::Cell(a), &[Value::Int(0); 3]).unwrap();
    assert_eq!(h.site().max_argument_count_including_this_for_varargs(), 4);

    h.call(Value::Cell(a), &[]).unwrap();
    assert_eq!(h.site().max_argument_count_including_this_for_varargs(), 4);

    h.call(Value::Cell(a), &[Value::Int(0); 40]).unwrap();
    assert_eq!(h.site().max_argument_count_including_this_for_varargs(), 16);
}

#[test]
fn replaced_code_is_entered_without_relinking() {
    let mut h = Harness::new(CallType::Call);
    let a = h.callee(1);
    assert_eq!(h.call_cell(a), 1);

    let executable = h.vm.executable_of(a).unwrap();
    let baseline = h.vm.code_block_for(executable, SpecializationKind::Call).unwrap();
    let optimized = h
        .vm
        .replace_code(baseline, return_capture_plus_1000, JitType::Optimized)
        .unwrap();

    assert_eq!(h.site().mode(), LinkMode::Monomorphic);
    assert_eq!(h.site().cached_target().map(|t| t.code_block()), Some(optimized));
    assert_eq!(h.call_cell(a), 1001);
    assert_eq!(h.site().slow_path_count(), 1);
    assert_eq!(h.vm.stats().upgrades, 1);
    assert_eq!(
        h.vm.code_blocks().get(optimized).unwrap().jit_type(),
        JitType::Optimized
    );
}

#[test]
fn jettisoned_callee_code_is_relinked_on_next_call() {
    let mut h = Harness::new(CallType::Call);
    let a = h.callee(1);
    let b = h.callee(2);
    h.call_cell(a);
    h.call_cell(b);
    assert_eq!(h.site().mode(), LinkMode::Polymorphic);

    let executable = h.vm.executable_of(a).unwrap();
    let code = h.vm.code_block_for(executable, SpecializationKind::Call).unwrap();
    h.vm.jettison_code(code).unwrap();

    // Only the case into the jettisoned code is dropped.
    assert_eq!(h.site().stub().map(|s| s.len()), Some(1));
    assert!(h.vm.jettison_code(code).is_err());
    h.vm.verify_call_links().unwrap();

    assert_eq!(h.call_cell(a), 1);
    assert_eq!(h.site().stub().map(|s| s.len()), Some(2));
    assert_eq!(h.vm.stats().jettison_unlinks, 1);
}

#[test]
fn jettisoned_caller_reverts_its_sites() {
    let mut h = Harness::new(CallType::Call);
    let a = h.callee(1);
    h.call_cell(a);

    let caller_code = h
        .vm
        .code_block_for(h.caller_executable, SpecializationKind::Call)
        .unwrap();
    h.vm.jettison_code(caller_code).unwrap();
    assert!(h.vm.code_block_for(h.caller_executable, SpecializationKind::Call).is_none());

    // Recompiled caller starts unlinked.
    assert_eq!(h.call_cell(a), 1);
    assert_eq!(h.site().mode(), LinkMode::Monomorphic);
    assert_eq!(h.site().slow_path_count(), 1);
}

#[test]
fn stats_serialize_to_json() {
    let mut h = Harness::new(CallType::Call);
    let a = h.callee(1);
    h.call_cell(a);
    let json = h.vm.stats().to_json();
    assert!(json.contains("\"monomorphic_links\":1"));
}

#[test]
fn disallowed_stubs_send_next_miss_virtual() {
    let mut h = Harness::new(CallType::Call);
    let a = h.callee(1);
    let b = h.callee(2);
    assert_eq!(h.call_cell(a), 1);

    let block = h
        .vm
        .code_block_for(h.caller_executable, SpecializationKind::Call)
        .unwrap();
    h.vm.disallow_stubs(block, 0).unwrap();
    assert_eq!(h.site().mode(), LinkMode::Monomorphic);
    assert!(!h.site().allow_stubs());

    assert_eq!(h.call_cell(b), 2);
    assert_eq!(h.site().mode(), LinkMode::Virtual);
    assert_eq!(h.call_cell(a), 1);
    assert!(h.vm.disallow_stubs(block, 3).is_err());
}

#[test]
fn disallowing_stubs_on_polymorphic_site_goes_virtual_at_once() {
    let mut h = Harness::new(CallType::Call);
    let a = h.callee(1);
    let b = h.callee(2);
    let c = h.callee(3);
    h.call_cell(a);
    h.call_cell(b);
    assert_eq!(h.site().mode(), LinkMode::Polymorphic);

    let block = h
        .vm
        .code_block_for(h.caller_executable, SpecializationKind::Call)
        .unwrap();
    h.vm.disallow_stubs(block, 0).unwrap();
    assert_eq!(h.site().mode(), LinkMode::Virtual);
    assert!(h.site().stub().is_none());
    assert_eq!(h.vm.stats().virtual_transitions, 1);

    assert_eq!(h.call_cell(c), 3);
    assert_eq!(h.site().mode(), LinkMode::Virtual);
}
