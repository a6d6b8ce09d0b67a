//! Integration tests for the host wrapper's one-shot lifecycle

use std::sync::{Arc, Barrier};

use tarry::runtime::error::{HostError, RuntimeError};
use tarry::runtime::{
    ActivityBehavior, ActivityInstanceState, Bookmark, BookmarkOptions, DefinitionBuilder,
    HostInstance, HostLifecycleState, NativeActivity, NativeActivityContext, RuntimeConfig,
    WorkflowExecutor, WorkflowStatus, boxed,
};

struct Park;

impl NativeActivity for Park {
    fn execute(&self, context: &mut NativeActivityContext) -> anyhow::Result<()> {
        context.create_bookmark("wake", BookmarkOptions::NONE)?;
        Ok(())
    }
}

fn host() -> HostInstance {
    let mut builder = DefinitionBuilder::new();
    let root = builder.add("Park", ActivityBehavior::native(Park));
    let definition = Arc::new(builder.build(root).unwrap());
    let executor = WorkflowExecutor::new(definition, RuntimeConfig::default()).unwrap();
    HostInstance::new(executor)
}

#[test]
fn test_load_abort_race_has_one_winner() {
    for _ in 0..50 {
        let host = Arc::new(host());
        let barrier = Arc::new(Barrier::new(2));

        let loader = {
            let host = host.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                host.load().map(|_| ())
            })
        };
        let aborter = {
            let host = host.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                host.abort("shutdown")
            })
        };

        let loaded = loader.join().unwrap();
        let aborted = aborter.join().unwrap();
        let final_state = host.lifecycle();

        match (loaded, aborted) {
            (Ok(()), Err(RuntimeError::Host(HostError::AlreadyTransitioned(seen)))) => {
                assert_eq!(seen, HostLifecycleState::Loaded);
                assert_eq!(final_state, HostLifecycleState::Loaded);
            }
            (Err(RuntimeError::Host(HostError::AlreadyTransitioned(seen))), Ok(())) => {
                assert_eq!(seen, HostLifecycleState::Aborted);
                assert_eq!(final_state, HostLifecycleState::Aborted);
            }
            (loaded, aborted) => {
                panic!("expected exactly one winner: {:?} / {:?}", loaded, aborted)
            }
        }
    }
}

#[test]
fn test_loaded_host_runs_and_resumes() {
    let host = host();
    host.load().unwrap();
    assert_eq!(host.run().unwrap(), WorkflowStatus::Idle);

    host.resume_bookmark(&Bookmark::named("wake"), boxed(())).unwrap();
    assert_eq!(
        host.run().unwrap(),
        WorkflowStatus::Completed(ActivityInstanceState::Closed)
    );
    assert_eq!(host.executor().bookmarks().len(), 0);
}

#[test]
fn test_abandon_faults_running_workflow() {
    let host = host();
    host.load().unwrap();
    host.run().unwrap();

    host.abandon().unwrap();
    assert!(host.is_abandoned());
    assert_eq!(
        host.executor().status(),
        WorkflowStatus::Completed(ActivityInstanceState::Faulted)
    );
    assert!(host.run().is_err());
}
