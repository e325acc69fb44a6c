/// Context isolation tests
///
/// Concurrent scopes, spawned children and worker threads must each see
/// only their own bindings.
/// Run with: cargo test --test context_isolation_tests

mod common;

use common::fixture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use webcontext::context::binding;
use webcontext::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_scopes_see_only_their_session() {
    let fx = Arc::new(fixture(ContextConfig::default()));
    let num_tasks = 32;
    let barrier = Arc::new(Barrier::new(num_tasks));

    let mut handles = vec![];
    for task_id in 0..num_tasks {
        let fx = Arc::clone(&fx);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            fx.manager
                .scope(None, |scope| async move {
                    SESSION.set_item("task", task_id)?;
                    REQUEST.set_item("task", task_id)?;
                    // Every scope is entered before any reads back.
                    barrier.wait().await;
                    for _ in 0..10 {
                        tokio::task::yield_now().await;
                        assert_eq!(SESSION.get_item_as::<usize>("task"), Some(task_id));
                        assert_eq!(REQUEST.get_item_as::<usize>("task"), Some(task_id));
                        assert_eq!(TOKEN.resolve().unwrap().as_str(), scope.token());
                    }
                    Ok::<_, ContextError>(scope.token().to_string())
                })
                .await
        }));
    }

    let mut tokens = std::collections::HashSet::new();
    for handle in handles {
        tokens.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(tokens.len(), num_tasks);
    assert_eq!(fx.store.len().await, num_tasks);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_child_inherits_a_copy_of_bindings() {
    let fx = fixture(ContextConfig::default());

    fx.manager
        .scope(None, |scope| async move {
            let parent_request = REQUEST.resolve().unwrap();

            let child = binding::spawn(async {
                let session = SESSION.resolve().unwrap();
                REQUEST.bind(Arc::new(Storage::new()))?;
                REQUEST.set_item("child", true)?;
                Ok::<_, ContextError>(session)
            });
            let child_session = child.await.unwrap()?;

            // The payload is shared; the rebinding is not.
            assert!(Arc::ptr_eq(&child_session, scope.session()));
            assert!(Arc::ptr_eq(&REQUEST.resolve().unwrap(), &parent_request));
            assert!(REQUEST.get_item("child").is_none());
            Ok::<_, ContextError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_plain_spawn_does_not_inherit_bindings() {
    let fx = fixture(ContextConfig::default());

    fx.manager
        .scope(None, |_| async move {
            let seen = tokio::spawn(async { SESSION.resolve().is_none() && !binding::is_active() })
                .await
                .unwrap();
            assert!(seen);
            Ok::<_, ContextError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_isolated_future_sees_no_scope() {
    let fx = fixture(ContextConfig::default());

    fx.manager
        .scope(None, |_| async move {
            binding::isolated(async {
                assert!(SESSION.resolve().is_none());
                assert!(!binding::is_active());
            })
            .await;
            assert!(binding::is_active());
            Ok::<_, ContextError>(())
        })
        .await
        .unwrap();
}

#[test]
fn test_worker_threads_see_only_their_session() {
    let fx = fixture(ContextConfig::default());
    let manager = &fx.manager;

    std::thread::scope(|threads| {
        for worker in 0..8usize {
            threads.spawn(move || {
                for round in 0..5usize {
                    let value = worker * 100 + round;
                    manager
                        .scope_blocking(None, |scope| {
                            SESSION.set_item("value", value)?;
                            std::thread::sleep(Duration::from_millis(1));
                            assert_eq!(SESSION.get_item_as::<usize>("value"), Some(value));
                            assert_eq!(TOKEN.resolve().unwrap().as_str(), scope.token());
                            Ok::<_, ContextError>(())
                        })
                        .unwrap();
                    // Pooled threads start the next request clean.
                    assert!(!binding::in_scope());
                }
            });
        }
    });

    assert_eq!(futures::executor::block_on(fx.store.len()), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawn_blocking_runs_thread_scopes() {
    let fx = Arc::new(fixture(ContextConfig::default()));

    let handles: Vec<_> = (0..4usize)
        .map(|n| {
            let fx = Arc::clone(&fx);
            tokio::task::spawn_blocking(move || {
                fx.manager.scope_blocking(None, |_| {
                    SESSION.set_item("n", n)?;
                    Ok::<_, ContextError>(SESSION.get_item_as::<usize>("n"))
                })
            })
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), Some(n));
    }
}
