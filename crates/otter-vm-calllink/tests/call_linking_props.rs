//! Property tests over random callee sequences at a single call site.

use proptest::prelude::*;

use otter_vm_calllink::{
    CallFrame, CallLinkConfig, CallLinkInfo, CallSiteDescriptor, CallType, CellId, Executable,
    LinkMode, RealmId, SpecializationKind, Value, Vm, VmResult,
};

fn return_capture(vm: &mut Vm, frame: &CallFrame) -> VmResult<Value> {
    Ok(vm
        .captures(frame.callee())
        .and_then(|captures| captures.first().copied())
        .unwrap_or_default())
}

fn call_first_argument(vm: &mut Vm, frame: &CallFrame) -> VmResult<Value> {
    let rest: Vec<Value> = frame.arguments().iter().skip(1).copied().collect();
    vm.execute_call(frame, 0, frame.argument(0), Value::Undefined, &rest)
}

struct Site {
    vm: Vm,
    caller: CellId,
    caller_executable: CellId,
}

impl Site {
    fn new(call_type: CallType, config: CallLinkConfig) -> Self {
        let config = CallLinkConfig {
            gc_allocation_threshold: 1 << 20,
            ..config
        };
        let mut vm = Vm::new(config).unwrap();
        let caller_executable = vm.allocate_executable(
            Executable::builder("caller", call_first_argument)
                .call_site(CallSiteDescriptor::new(call_type, 4))
                .build(),
        );
        let caller = vm.create_function(caller_executable).unwrap();
        vm.add_root(caller);
        Self {
            vm,
            caller,
            caller_executable,
        }
    }

    /// Rooted callees returning `0..k`, each with its own executable.
    fn callees(&mut self, k: usize) -> Vec<CellId> {
        (0..k)
            .map(|n| {
                let executable = self.vm.allocate_executable(
                    Executable::builder(format!("f{n}"), return_capture).build(),
                );
                let callee = self
                    .vm
                    .create_closure(executable, RealmId::default(), vec![Value::Int(n as i64)])
                    .unwrap();
                self.vm.add_root(callee);
                callee
            })
            .collect()
    }

    fn call(&mut self, callee: CellId, rest: &[Value]) -> Value {
        let mut args = vec![Value::Cell(callee)];
        args.extend_from_slice(rest);
        self.vm
            .call(Value::Cell(self.caller), Value::Undefined, &args)
            .unwrap()
    }

    fn info(&self) -> &CallLinkInfo {
        let block = self
            .vm
            .code_block_for(self.caller_executable, SpecializationKind::Call)
            .expect("caller compiled");
        self.vm.call_link_info(block, 0).unwrap()
    }
}

/// `k` distinct callee indices, each appearing at least once, preceded by
/// arbitrary repeats.
fn callee_sequence() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1usize..=8).prop_flat_map(|k| {
        (
            Just(k),
            prop::collection::vec(0..k, 0..30),
            Just((0..k).collect::<Vec<_>>()).prop_shuffle(),
        )
            .prop_map(|(k, mut extras, permutation)| {
                extras.extend(permutation);
                (k, extras)
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn site_mode_follows_distinct_callee_count(
        (k, sequence) in callee_sequence(),
        capacity in 1u32..=6,
    ) {
        let config = CallLinkConfig {
            polymorphic_capacity: capacity,
            ..Default::default()
        };
        let mut site = Site::new(CallType::Call, config);
        let callees = site.callees(k);

        for &n in &sequence {
            prop_assert_eq!(site.call(callees[n], &[]), Value::Int(n as i64));
        }

        let info = site.info();
        if k == 1 {
            prop_assert_eq!(info.mode(), LinkMode::Monomorphic);
        } else if k as u32 <= capacity {
            prop_assert_eq!(info.mode(), LinkMode::Polymorphic);
            prop_assert_eq!(info.stub().map(|stub| stub.len()), Some(k));
        } else {
            prop_assert_eq!(info.mode(), LinkMode::Virtual);
            prop_assert!(info.stub().is_none());
        }

        // Replaying in another order dispatches correctly, and a cached
        // site never misses.
        let slow = site.info().slow_path_count();
        for &n in sequence.iter().rev() {
            prop_assert_eq!(site.call(callees[n], &[]), Value::Int(n as i64));
        }
        if k as u32 <= capacity {
            prop_assert_eq!(site.info().slow_path_count(), slow);
        }
        site.vm.verify_call_links().unwrap();
    }

    #[test]
    fn varargs_profile_tracks_running_max(
        ceiling in 1u32..=64,
        lengths in prop::collection::vec(0usize..100, 1..20),
    ) {
        let config = CallLinkConfig {
            max_varargs_argument_count: ceiling,
            ..Default::default()
        };
        let mut site = Site::new(CallType::CallVarargs, config);
        let callee = site.callees(1)[0];

        let mut seen = 0u32;
        let mut previous = 0u32;
        for len in lengths {
            site.call(callee, &vec![Value::Int(0); len]);
            seen = seen.max(len as u32 + 1);
            let profile = site.info().max_argument_count_including_this_for_varargs();
            prop_assert_eq!(profile, seen.min(ceiling));
            prop_assert!(profile >= previous);
            previous = profile;
        }
    }
}
