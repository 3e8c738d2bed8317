//! Proxy identity, reclamation and disposal
//!
//! Reclamation is observed through `Environment::stats`: dropped proxies must
//! leave the intern table after a collection cycle, and the registry must not
//! keep growing when proxies are created and dropped in a loop.

use moonlink_runtime::{Environment, EnvironmentConfig, Error, ThreadStatus, Value};

#[test]
fn test_same_object_same_proxy() {
    let env = Environment::new().unwrap();
    env.eval("t = {}; f = function() end; co = coroutine.create(f)").unwrap();

    let mut held = Vec::new();
    for name in ["t", "f", "co"] {
        let first = env.get_global(name).unwrap();
        let second = env.get_global(name).unwrap();
        assert!(first.is_foreign_object(), "{} is {:?}", name, first);
        assert_eq!(first, second, "{} lost identity", name);
        held.push(first);
    }
    assert_eq!(env.stats().unwrap().interned, 3);

    let other = env.eval("return {}").unwrap()[0].clone();
    assert_ne!(env.get_global("t").unwrap(), other);
}

#[test]
fn test_proxy_round_trip_keeps_object() {
    let env = Environment::new().unwrap();
    let table = env.create_table().unwrap();
    env.set_global("a", table.clone()).unwrap();
    env.set_global("b", table).unwrap();
    assert_eq!(
        env.eval("return rawequal(a, b)").unwrap()[0],
        Value::Boolean(true)
    );
}

#[test]
fn test_dropped_proxies_are_reclaimed() {
    let env = Environment::new().unwrap();
    let mut tables = Vec::new();
    for round in 0..20 {
        let table = env.create_table().unwrap();
        table.set("round", round).unwrap();
        tables.push(table);
    }
    assert_eq!(env.stats().unwrap().interned, 20);
    drop(tables);

    env.collect_garbage().unwrap();
    let stats = env.stats().unwrap();
    assert_eq!(stats.interned, 0);
    assert!(stats.sweeps >= 1);
    assert!(stats.released >= 20);
}

#[test]
fn test_every_proxy_kind_is_reclaimed() {
    let env = Environment::new().unwrap();
    let held = vec![
        env.eval("return function() end").unwrap()[0].clone(),
        env.eval("return coroutine.create(print)").unwrap()[0].clone(),
        env.eval("return io.stdout").unwrap()[0].clone(),
    ];
    assert!(matches!(held[0], Value::Function(_)));
    assert!(matches!(held[1], Value::Thread(_)));
    assert!(matches!(held[2], Value::UserData(_)));
    assert_eq!(env.stats().unwrap().interned, 3);
    drop(held);

    env.collect_garbage().unwrap();
    assert_eq!(env.stats().unwrap().interned, 0);
    assert_eq!(env.stack_depth().unwrap(), 0);
}

#[test]
fn test_registry_does_not_grow() {
    let env = Environment::new().unwrap();
    let churn = |env: &Environment| {
        for i in 0..100 {
            let table = env.create_table().unwrap();
            table.set(1, i).unwrap();
        }
        env.collect_garbage().unwrap();
    };

    churn(&env);
    let baseline = env.stats().unwrap().registry_slots;
    for _ in 0..200 {
        churn(&env);
    }
    let stats = env.stats().unwrap();
    assert_eq!(stats.interned, 0);
    assert!(
        stats.registry_slots <= baseline + 1,
        "registry grew from {} to {}",
        baseline,
        stats.registry_slots
    );
}

#[test]
fn test_live_proxies_survive_collection() {
    let env = Environment::new().unwrap();
    let kept = env.create_table().unwrap();
    kept.set("x", 1).unwrap();
    for _ in 0..3 {
        env.collect_garbage().unwrap();
    }
    assert_eq!(kept.get("x").unwrap(), Value::Integer(1));
    assert_eq!(env.stats().unwrap().interned, 1);
}

#[test]
fn test_pending_entry_is_reused() {
    let env = Environment::with_config(EnvironmentConfig::new().with_collection_hook(false))
        .unwrap();
    env.eval("t = {}").unwrap();

    drop(env.get_global("t").unwrap());
    let slots = env.stats().unwrap().registry_slots;
    for _ in 0..10 {
        drop(env.get_global("t").unwrap());
    }
    let stats = env.stats().unwrap();
    assert_eq!(stats.interned, 1);
    assert_eq!(stats.registry_slots, slots);
}

#[test]
fn test_explicit_sweep_without_hook() {
    let env = Environment::with_config(EnvironmentConfig::new().with_collection_hook(false))
        .unwrap();
    for _ in 0..5 {
        drop(env.create_table().unwrap());
    }
    env.collect_garbage().unwrap();
    assert_eq!(env.stats().unwrap().interned, 5);

    assert_eq!(env.sweep().unwrap(), 5);
    assert_eq!(env.stats().unwrap().interned, 0);
    assert_eq!(env.sweep().unwrap(), 0);
}

#[test]
fn test_cross_environment_push_is_rejected() {
    let env_a = Environment::new().unwrap();
    let env_b = Environment::new().unwrap();
    let table_a = env_a.create_table().unwrap();

    let err = env_b.set_global("stolen", table_a.clone()).unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)), "{:?}", err);
    assert_eq!(env_b.stack_depth().unwrap(), 0);
    assert_eq!(env_b.get_global("stolen").unwrap(), Value::Nil);

    let table_b = env_b.create_table().unwrap();
    assert!(matches!(
        table_b.set("k", table_a),
        Err(Error::InvalidOperation(_))
    ));
    assert_eq!(env_b.stack_depth().unwrap(), 0);
}

#[test]
fn test_failed_argument_push_leaves_stack_unchanged() {
    let env_a = Environment::new().unwrap();
    let env_b = Environment::new().unwrap();
    let foreign = Value::Table(env_a.create_table().unwrap());
    let args = [Value::Integer(1), Value::Integer(2), foreign];

    let sum = env_b.load("local a, b = ... ; return a + b", "=sum").unwrap();
    let err = sum.call(&args).unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)), "{:?}", err);
    assert_eq!(env_b.stack_depth().unwrap(), 0);
    assert_eq!(sum.call(&args[..2]).unwrap()[0], Value::Integer(3));

    let thread = env_b.create_thread(&sum).unwrap();
    let err = thread.resume(&args).unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)), "{:?}", err);
    assert_eq!(env_b.stack_depth().unwrap(), 0);
    assert_eq!(thread.status().unwrap(), ThreadStatus::NotStarted);
    assert_eq!(thread.resume(&args[..2]).unwrap()[0], Value::Integer(3));
    assert_eq!(thread.status().unwrap(), ThreadStatus::Finished);
}

#[test]
fn test_disposed_proxy() {
    let env = Environment::new().unwrap();
    let table = env.create_table().unwrap();
    let alias = table.clone();
    table.dispose();
    table.dispose();

    assert!(alias.is_disposed());
    assert_eq!(alias.get("k").unwrap_err(), Error::Disposed("table"));
    assert_eq!(
        env.set_global("t", alias).unwrap_err(),
        Error::Disposed("table")
    );
    assert_eq!(env.stats().unwrap().interned, 0);
    assert_eq!(env.stack_depth().unwrap(), 0);
}

#[test]
fn test_proxies_outlive_environment() {
    let env = Environment::new().unwrap();
    let table = env.create_table().unwrap();
    let func = env.load("return 1", "=f").unwrap();
    env.dispose();

    assert!(table.is_disposed());
    assert_eq!(table.get("k").unwrap_err(), Error::Disposed("environment"));
    assert_eq!(func.call(&[]).unwrap_err(), Error::Disposed("environment"));
    func.dispose();
    assert_eq!(func.call(&[]).unwrap_err(), Error::Disposed("function"));

    drop(env);
    assert_eq!(table.len().unwrap_err(), Error::Disposed("environment"));
}

#[test]
fn test_object_pulled_again_after_reclamation() {
    let env = Environment::new().unwrap();
    env.eval("t = { n = 1 }").unwrap();
    drop(env.get_global("t").unwrap());
    env.collect_garbage().unwrap();
    assert_eq!(env.stats().unwrap().interned, 0);

    let table = env.get_global("t").unwrap().to_table().unwrap();
    assert_eq!(table.get("n").unwrap(), Value::Integer(1));
}
