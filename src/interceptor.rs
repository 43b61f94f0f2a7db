//! Hooks the collector into the host runtime.
//!
//! The host exposes two extension points, one called for every node it
//! dispatches and one called when a run starts. [`HostRuntime`] holds both as
//! swappable closures. [`Interceptor::install`] wraps them once, so that every
//! call is observed by the [`Registry`] before being passed on unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::{HostError, InstallError};
use crate::graph::{NodeId, Workflow};
use crate::registry::{Registry, RunId};
use crate::value::{Inputs, Outputs};

/// A single node dispatch, inputs already resolved by the host.
#[derive(Debug, Clone)]
pub struct NodeCall {
    pub node_id: NodeId,
    pub class_name: String,
    pub inputs: Inputs,
}

impl NodeCall {
    pub fn new(node_id: impl Into<NodeId>, class_name: impl Into<String>, inputs: Inputs) -> Self {
        Self {
            node_id: node_id.into(),
            class_name: class_name.into(),
            inputs,
        }
    }
}

/// Start of a run, with the graph as the author declared it.
#[derive(Debug, Clone)]
pub struct RunStart {
    pub run_id: RunId,
    pub graph: Arc<Workflow>,
}

pub type DispatchFn = Arc<dyn Fn(&NodeCall) -> Result<Outputs, HostError> + Send + Sync>;
pub type RunStartFn = Arc<dyn Fn(&RunStart) -> Result<(), HostError> + Send + Sync>;

/// The host's extension points.
pub struct HostRuntime {
    dispatch: RwLock<DispatchFn>,
    run_start: RwLock<RunStartFn>,
    /// Set while an interceptor wraps the extension points.
    intercepted: AtomicBool,
}

impl HostRuntime {
    pub fn new<D, S>(dispatch: D, run_start: S) -> Self
    where
        D: Fn(&NodeCall) -> Result<Outputs, HostError> + Send + Sync + 'static,
        S: Fn(&RunStart) -> Result<(), HostError> + Send + Sync + 'static,
    {
        let dispatch: DispatchFn = Arc::new(dispatch);
        let run_start: RunStartFn = Arc::new(run_start);

        Self {
            dispatch: RwLock::new(dispatch),
            run_start: RwLock::new(run_start),
            intercepted: AtomicBool::new(false),
        }
    }

    /// Executes a node through whatever is currently installed.
    pub fn dispatch(&self, call: &NodeCall) -> Result<Outputs, HostError> {
        let dispatch = self.dispatch_fn();
        dispatch(call)
    }

    pub fn start_run(&self, start: &RunStart) -> Result<(), HostError> {
        let run_start = self.run_start_fn();
        run_start(start)
    }

    pub fn dispatch_fn(&self) -> DispatchFn {
        self.dispatch
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn run_start_fn(&self) -> RunStartFn {
        self.run_start
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any interceptor currently wraps this runtime.
    pub fn is_intercepted(&self) -> bool {
        self.intercepted.load(Ordering::Acquire)
    }

    /// Marks the runtime as intercepted, `false` if it already was.
    fn claim(&self) -> bool {
        self.intercepted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.intercepted.store(false, Ordering::Release);
    }

    /// Replaces the dispatch point with `wrap(current)`, returning `current`.
    pub fn wrap_dispatch(&self, wrap: impl FnOnce(DispatchFn) -> DispatchFn) -> DispatchFn {
        let mut slot = self.dispatch.write().unwrap_or_else(PoisonError::into_inner);
        let current = slot.clone();
        *slot = wrap(current.clone());
        current
    }

    /// Replaces the run start point with `wrap(current)`, returning `current`.
    pub fn wrap_run_start(&self, wrap: impl FnOnce(RunStartFn) -> RunStartFn) -> RunStartFn {
        let mut slot = self.run_start.write().unwrap_or_else(PoisonError::into_inner);
        let current = slot.clone();
        *slot = wrap(current.clone());
        current
    }
}

pub struct Interceptor {
    runtime: Arc<HostRuntime>,
    registry: Arc<Registry>,
    /// Extension points as they were before `install`.
    originals: Mutex<Option<(DispatchFn, RunStartFn)>>,
}

impl Interceptor {
    pub fn new(runtime: Arc<HostRuntime>, registry: Arc<Registry>) -> Self {
        Self {
            runtime,
            registry,
            originals: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether this interceptor is the one wrapping the runtime.
    pub fn is_installed(&self) -> bool {
        self.originals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Wraps both extension points.
    ///
    /// Returns `false` if the runtime is already intercepted, whether by this
    /// interceptor or another one.
    pub fn install(&self) -> bool {
        if !self.runtime.claim() {
            tracing::debug!("runtime already intercepted");
            return false;
        }

        let registry = self.registry.clone();
        let dispatch = self.runtime.wrap_dispatch(|original| {
            let wrapped: DispatchFn = Arc::new(move |call: &NodeCall| -> Result<Outputs, HostError> {
                registry.record_node_execution(&call.node_id, &call.class_name, &call.inputs, None);
                let outputs = original(call)?;
                registry.update_node_execution(&call.node_id, &call.class_name, &outputs);
                Ok(outputs)
            });
            wrapped
        });

        let registry = self.registry.clone();
        let run_start = self.runtime.wrap_run_start(|original| {
            let wrapped: RunStartFn = Arc::new(move |start: &RunStart| {
                registry.start_collection(&start.run_id);
                registry.set_current_graph(&start.run_id, start.graph.clone());
                original(start)
            });
            wrapped
        });

        *self.originals.lock().unwrap_or_else(PoisonError::into_inner) = Some((dispatch, run_start));

        tracing::info!("interceptor installed");
        true
    }

    /// Puts the original extension points back.
    pub fn uninstall(&self) -> Result<(), InstallError> {
        let originals = self
            .originals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some((dispatch, run_start)) = originals else {
            return Err(InstallError::NotInstalled);
        };

        self.runtime.wrap_dispatch(|_| dispatch);
        self.runtime.wrap_run_start(|_| run_start);
        self.runtime.release();

        tracing::info!("interceptor uninstalled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::extract::json_inputs as inputs;
    use crate::graph::Node;
    use crate::value::Value;
    use serde_json::json;

    struct Host {
        runtime: Arc<HostRuntime>,
        dispatched: Arc<AtomicUsize>,
        started: Arc<AtomicUsize>,
    }

    fn host() -> Host {
        let dispatched = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));

        let runtime = {
            let dispatched = dispatched.clone();
            let started = started.clone();
            HostRuntime::new(
                move |call: &NodeCall| {
                    dispatched.fetch_add(1, Ordering::SeqCst);
                    match call.class_name.as_str() {
                        "Broken" => Err(anyhow::anyhow!("node {} failed", call.node_id)),
                        "CLIPTextEncode" => Ok(vec![Value::object("conditioning")]),
                        _ => Ok(vec![]),
                    }
                },
                move |_: &RunStart| {
                    started.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
        };

        Host {
            runtime: Arc::new(runtime),
            dispatched,
            started,
        }
    }

    fn start(runtime: &HostRuntime, run_id: &str) {
        let graph = Workflow::new([(
            "6".to_string(),
            Node::new("CLIPTextEncode").with_literal("text", "a castle"),
        )]);

        runtime
            .start_run(&RunStart {
                run_id: run_id.into(),
                graph: Arc::new(graph),
            })
            .unwrap();
    }

    fn encode() -> NodeCall {
        NodeCall::new("6", "CLIPTextEncode", inputs(&[("text", json!("a castle"))]))
    }

    #[test]
    fn test_observes_run_and_dispatch() {
        let host = host();
        let registry = Arc::new(Registry::default());
        let interceptor = Interceptor::new(host.runtime.clone(), registry.clone());
        assert!(interceptor.install());

        start(&host.runtime, "run-1");
        let outputs = host.runtime.dispatch(&encode()).unwrap();

        assert_eq!(host.started.load(Ordering::SeqCst), 1);
        assert_eq!(host.dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(outputs.len(), 1);

        let metadata = registry.get_metadata("run-1");
        let prompt = &metadata.prompts["6"];
        assert_eq!(prompt.text.as_deref(), Some("a castle"));
        assert!(Arc::ptr_eq(
            prompt.conditioning.as_ref().unwrap(),
            outputs[0].as_payload().unwrap()
        ));
        assert!(metadata.graph().is_some_and(|graph| graph.contains("6")));
    }

    #[test]
    fn test_install_is_idempotent() {
        let host = host();
        let original = host.runtime.dispatch_fn();
        let interceptor = Interceptor::new(host.runtime.clone(), Arc::new(Registry::default()));

        assert!(interceptor.install());
        let wrapped = host.runtime.dispatch_fn();
        assert!(!interceptor.install());
        assert!(Arc::ptr_eq(&wrapped, &host.runtime.dispatch_fn()));

        start(&host.runtime, "run-1");
        host.runtime.dispatch(&encode()).unwrap();
        assert_eq!(host.dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(interceptor.registry().get_metadata("run-1").execution_order, vec!["6"]);

        interceptor.uninstall().unwrap();
        assert!(Arc::ptr_eq(&original, &host.runtime.dispatch_fn()));
        assert!(!interceptor.is_installed());
    }

    #[test]
    fn test_second_interceptor_does_not_wrap_again() {
        let host = host();
        let first = Interceptor::new(host.runtime.clone(), Arc::new(Registry::default()));
        let second = Interceptor::new(host.runtime.clone(), Arc::new(Registry::default()));

        assert!(first.install());
        let wrapped = host.runtime.dispatch_fn();
        assert!(!second.install());
        assert!(Arc::ptr_eq(&wrapped, &host.runtime.dispatch_fn()));
        assert!(host.runtime.is_intercepted());
        assert!(first.is_installed());
        assert!(!second.is_installed());
        assert!(matches!(second.uninstall(), Err(InstallError::NotInstalled)));

        start(&host.runtime, "run-1");
        host.runtime.dispatch(&encode()).unwrap();
        assert_eq!(host.dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(first.registry().get_metadata("run-1").execution_order, vec!["6"]);
        assert!(second.registry().get_metadata("run-1").is_empty());

        first.uninstall().unwrap();
        assert!(!host.runtime.is_intercepted());
        assert!(second.install());
    }

    #[test]
    fn test_errors_pass_through() {
        let host = host();
        let registry = Arc::new(Registry::default());
        let interceptor = Interceptor::new(host.runtime.clone(), registry.clone());
        interceptor.install();
        start(&host.runtime, "run-1");

        let call = NodeCall::new("9", "Broken", inputs(&[]));
        let err = host.runtime.dispatch(&call).unwrap_err();

        assert_eq!(err.to_string(), "node 9 failed");
        assert_eq!(registry.get_metadata("run-1").execution_order, vec!["9"]);
    }

    #[test]
    fn test_uninstall_requires_install() {
        let host = host();
        let interceptor = Interceptor::new(host.runtime.clone(), Arc::new(Registry::default()));

        assert!(matches!(interceptor.uninstall(), Err(InstallError::NotInstalled)));

        interceptor.install();
        interceptor.uninstall().unwrap();
        assert!(interceptor.install());
    }

    #[test]
    fn test_uninstalled_runtime_is_not_observed() {
        let host = host();
        let registry = Arc::new(Registry::default());
        let interceptor = Interceptor::new(host.runtime.clone(), registry.clone());
        interceptor.install();
        interceptor.uninstall().unwrap();

        start(&host.runtime, "run-1");
        host.runtime.dispatch(&encode()).unwrap();

        assert!(registry.current_run().is_none());
        assert!(registry.get_metadata("run-1").is_empty());
    }
}
