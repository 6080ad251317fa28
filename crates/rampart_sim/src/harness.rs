//! Bench assembling an engine, bindings, and handles for tests.

use crate::bindings::RecordingBindings;
use crate::engine::{SimConfig, SimEngine};
use rampart_wasm::{AsyncContractHandle, ContractHandle, ContractParams, StateBindings};
use std::sync::Arc;

/// Minimal bytecode accepted by the simulator (wasm magic + version)
pub const TEST_BYTECODE: [u8; 8] = [0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

/// One engine plus recording bindings, ready to hand out handles
pub struct TestBench {
    /// The simulated engine
    pub engine: Arc<SimEngine>,
    /// Bindings shared by every handle from this bench
    pub bindings: Arc<RecordingBindings>,
}

impl TestBench {
    /// Bench with the default simulator configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    /// Bench with a specific simulator configuration
    #[must_use]
    pub fn with_config(config: SimConfig) -> Self {
        Self {
            engine: Arc::new(SimEngine::new(config)),
            bindings: Arc::new(RecordingBindings::new()),
        }
    }

    /// Default contract parameters for bench handles
    #[must_use]
    pub fn params(&self) -> ContractParams {
        ContractParams::new(TEST_BYTECODE.to_vec()).with_max_gas(10_000_000)
    }

    /// Fresh synchronous handle against this bench's engine
    #[must_use]
    pub fn handle(&self) -> ContractHandle<SimEngine> {
        ContractHandle::new(
            Arc::clone(&self.engine),
            self.params(),
            Arc::clone(&self.bindings) as Arc<dyn StateBindings>,
        )
    }

    /// Fresh asynchronous handle against this bench's engine
    #[must_use]
    pub fn async_handle(&self) -> AsyncContractHandle<SimEngine> {
        AsyncContractHandle::new(
            Arc::clone(&self.engine),
            self.params(),
            Arc::clone(&self.bindings) as Arc<dyn StateBindings>,
        )
    }
}

impl Default for TestBench {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimConfig;
    use proptest::prelude::*;
    use rampart_core::GuestPtr;
    use rampart_wasm::engine::GuestExport;
    use rampart_wasm::{codec, LifecycleState, VmError};
    use std::sync::Mutex;

    #[test]
    fn test_end_to_end_execute_then_dispose() {
        let bench = TestBench::new();
        let metered: Arc<Mutex<Vec<(u64, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&metered);
        let mut handle = bench
            .handle()
            .with_meter(move |delta, export| sink.lock().unwrap().push((delta, export.into())));

        let result = handle.execute(&[0xAA; 32]).unwrap();
        assert_eq!(result, vec![0xAA; 32]);
        assert!(handle.used_gas().unwrap() > 0);

        let seen = metered.lock().unwrap().clone();
        assert!(seen.iter().any(|(_, name)| name == "execute"));
        assert!(seen.iter().any(|(_, name)| name == "__pin"));
        assert!(seen.iter().map(|(delta, _)| delta).sum::<u64>() > 0);

        handle.dispose().unwrap();
        assert_eq!(handle.state(), LifecycleState::Disposed);
        assert_eq!(handle.execute(&[0xAA; 32]).unwrap_err(), VmError::Disposed);
    }

    #[tokio::test]
    async fn test_end_to_end_execute_then_dispose_async() {
        let bench = TestBench::new();
        let mut handle = bench.async_handle();

        let result = handle.execute(&[0xAA; 32]).await.unwrap();
        assert_eq!(result, vec![0xAA; 32]);
        assert!(handle.used_gas().await.unwrap() > 0);

        handle.dispose().await.unwrap();
        assert_eq!(handle.state(), LifecycleState::Disposed);
        assert_eq!(
            handle.execute(&[0xAA; 32]).await.unwrap_err(),
            VmError::Disposed
        );
    }

    #[test]
    fn test_array_round_trip_edge_lengths() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        for payload in [Vec::new(), vec![0x7F]] {
            let ptr = handle.lower_bytes(&payload).unwrap();
            assert!(!ptr.is_null());
            assert_eq!(handle.lift_bytes(ptr).unwrap().unwrap(), payload);
        }
    }

    #[test]
    fn test_lower_absent_array_is_null_without_allocation() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        let ptr = handle
            .lower_typed_array(None, codec::UINT8_ARRAY_ID)
            .unwrap();
        assert_eq!(ptr, GuestPtr::NULL);
        assert_eq!(handle.lift_bytes(ptr).unwrap(), None);
    }

    #[test]
    fn test_string_round_trip_lengths() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        // 1025 code units forces the multi-chunk lift path
        for s in [
            String::new(),
            "a".to_string(),
            "g".repeat(1025),
            "x".repeat(100_000),
        ] {
            let ptr = handle.lower_string(Some(&s)).unwrap();
            assert_eq!(handle.lift_string(ptr).unwrap().as_deref(), Some(s.as_str()));
        }
    }

    #[test]
    fn test_string_null_round_trip() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        let ptr = handle.lower_string(None).unwrap();
        assert!(ptr.is_null());
        assert_eq!(handle.lift_string(ptr).unwrap(), None);
    }

    #[tokio::test]
    async fn test_async_round_trips() {
        let bench = TestBench::new();
        let mut handle = bench.async_handle();

        let ptr = handle.lower_bytes(&[1, 2, 3]).await.unwrap();
        assert_eq!(handle.lift_bytes(ptr).await.unwrap().unwrap(), vec![1, 2, 3]);

        let s = "swap".repeat(300);
        let ptr = handle.lower_string(Some(&s)).await.unwrap();
        assert_eq!(
            handle.lift_string(ptr).await.unwrap().as_deref(),
            Some(s.as_str())
        );
    }

    #[test]
    fn test_refcount_balance() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        let id = handle.instance_id().unwrap();

        let ptr = handle.lower_bytes(&[5; 8]).unwrap();
        let ptr = handle.retain(ptr).unwrap();
        let again = handle.retain(ptr).unwrap();
        assert_eq!(again, ptr);
        assert_eq!(handle.tracked_pointers(), 1);

        handle.release(ptr).unwrap();
        assert_eq!(handle.tracked_pointers(), 1);
        handle.release(ptr).unwrap();
        assert_eq!(handle.tracked_pointers(), 0);
        assert_eq!(bench.engine.pin_count(id), 0);
    }

    #[test]
    fn test_release_of_untracked_pointer_is_refcount_error() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        handle.instance_id().unwrap();
        let stray = GuestPtr::from_raw(0x40);
        for _ in 0..3 {
            assert_eq!(
                handle.release(stray).unwrap_err(),
                VmError::Refcount { pointer: stray }
            );
        }
    }

    #[test]
    fn test_gas_monotonic_and_deltas_sum_to_cumulative() {
        let bench = TestBench::new();
        let metered: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&metered);
        let mut handle = bench
            .handle()
            .with_meter(move |delta, _| sink.lock().unwrap().push(delta));

        let mut readings = Vec::new();
        for _ in 0..4 {
            handle.execute(&[0xAB; 16]).unwrap();
            readings.push(handle.used_gas().unwrap());
        }
        assert!(readings.windows(2).all(|w| w[0] <= w[1]));
        let total: u64 = metered.lock().unwrap().iter().sum();
        assert_eq!(total, *readings.last().unwrap());
    }

    #[test]
    fn test_abort_translation_disposes_the_instance() {
        let bench = TestBench::with_config(SimConfig::new().with_abort(
            GuestExport::Execute,
            "liquidity underflow",
            "pool.ts",
            87,
            13,
        ));
        let mut handle = bench.handle();
        let id = handle.instance_id().unwrap();

        let err = handle.execute(&[0xAA; 4]).unwrap_err();
        assert_eq!(
            err,
            VmError::Aborted {
                message: "liquidity underflow".to_string(),
                file_name: "pool.ts".to_string(),
                line: 87,
                column: 13,
            }
        );
        assert_eq!(
            err.to_string(),
            "Execution aborted: liquidity underflow at pool.ts:87:13"
        );
        assert_eq!(handle.state(), LifecycleState::Disposed);
        assert!(bench.engine.is_destroyed(id));
        assert!(!bench.engine.bindings_registered(id));
        assert_eq!(handle.execute(&[0xAA; 4]).unwrap_err(), VmError::Disposed);
    }

    #[tokio::test]
    async fn test_abort_translation_async() {
        let bench = TestBench::with_config(SimConfig::new().with_abort(
            GuestExport::Execute,
            "overflow",
            "amm.ts",
            3,
            1,
        ));
        let mut handle = bench.async_handle();
        let err = handle.execute(&[1]).await.unwrap_err();
        assert!(matches!(err, VmError::Aborted { line: 3, .. }));
        assert_eq!(handle.state(), LifecycleState::Disposed);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        handle.execute(&[1, 2]).unwrap();

        handle.dispose().unwrap();
        assert_eq!(handle.state(), LifecycleState::Disposed);
        assert!(handle.final_gas().is_some());
        handle.dispose().unwrap();
        assert_eq!(handle.state(), LifecycleState::Disposed);
    }

    #[test]
    fn test_dispose_without_instantiation() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        handle.dispose().unwrap();
        assert_eq!(handle.state(), LifecycleState::Disposed);
        assert!(handle.final_gas().is_none());
    }

    #[test]
    fn test_contended_gas_read_at_disposal_is_reentrancy() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        let id = handle.instance_id().unwrap();

        bench.engine.set_contended(true);
        let err = handle.dispose().unwrap_err();
        assert!(matches!(err, VmError::Reentrancy { .. }));
        // teardown still completed
        assert_eq!(handle.state(), LifecycleState::Disposed);
        assert!(bench.engine.is_destroyed(id));
        bench.engine.set_contended(false);
        handle.dispose().unwrap();
    }

    #[test]
    fn test_load_storage_collects_first() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        // the simulator rejects loadStorage without a prior sweep, so this
        // passing proves the handle ran one
        handle.load_storage(&[1, 2, 3]).unwrap();
    }

    #[test]
    fn test_set_environment_reaches_the_guest() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        let id = handle.instance_id().unwrap();
        handle.set_environment(&[9, 9, 9]).unwrap();
        assert_eq!(bench.engine.environment(id), Some(vec![9, 9, 9]));
    }

    #[test]
    fn test_guest_log_reaches_bindings() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        handle.execute(&[0u8; 32]).unwrap();
        assert!(bench
            .bindings
            .logs()
            .iter()
            .any(|line| line == "execute with 32 bytes"));
    }

    #[test]
    fn test_getter_exports_answer_empty_buffers() {
        let bench = TestBench::new();
        let mut handle = bench.handle();
        assert!(handle.get_events().unwrap().is_empty());
        assert!(handle.get_view_abi().unwrap().is_empty());
        assert!(handle.get_modified_storage().unwrap().is_empty());
        handle.define_selectors().unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_array_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let bench = TestBench::new();
            let mut handle = bench.handle();
            let ptr = handle.lower_bytes(&payload).unwrap();
            prop_assert_eq!(handle.lift_bytes(ptr).unwrap().unwrap(), payload);
        }

        #[test]
        fn prop_string_round_trip(s in ".{0,512}") {
            let bench = TestBench::new();
            let mut handle = bench.handle();
            let ptr = handle.lower_string(Some(&s)).unwrap();
            prop_assert_eq!(handle.lift_string(ptr).unwrap(), Some(s));
        }

        #[test]
        fn prop_balanced_retains_leave_no_pins(retains in 1usize..6) {
            let bench = TestBench::new();
            let mut handle = bench.handle();
            let id = handle.instance_id().unwrap();
            let ptr = handle.lower_bytes(&[0xCD; 16]).unwrap();
            let ptr = handle.retain(ptr).unwrap();
            for _ in 1..retains {
                handle.retain(ptr).unwrap();
            }
            for _ in 0..retains {
                handle.release(ptr).unwrap();
            }
            prop_assert_eq!(handle.tracked_pointers(), 0);
            prop_assert_eq!(bench.engine.pin_count(id), 0);
        }
    }
}
