//! Behavioural tests for memoized computations

#![allow(clippy::unwrap_used, clippy::expect_used)]

use filecache::{CacheOptions, RegistryConfig, SECOND, StoreLocation, StoreRegistry, Validity};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn registry(dir: &TempDir) -> Arc<StoreRegistry> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("filecache=debug")
        .with_test_writer()
        .try_init();
    StoreRegistry::with_config(RegistryConfig::new().with_root(dir.path()))
}

#[test]
fn test_identity_within_validity_computes_once() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let calls = AtomicUsize::new(0);
    let f = registry
        .cached(CacheOptions::within(30 * SECOND))
        .wrap("f", |x: &i32| {
            calls.fetch_add(1, Ordering::SeqCst);
            *x
        });

    assert_eq!(f.call(&1).unwrap(), 1);
    assert_eq!(f.call(&1).unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_short_validity_expires() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let queue = parking_lot::Mutex::new(vec![1337, 69]);
    let g = registry
        .cached(CacheOptions::new().with_validity(Validity::seconds(0.1)))
        .wrap("g", |_: &()| queue.lock().pop());

    assert_eq!(g.call(&()).unwrap(), Some(69));
    assert_eq!(g.call(&()).unwrap(), Some(69));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(g.call(&()).unwrap(), Some(1337));
}

#[test]
fn test_repeated_slow_calls_take_one_computation() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let slow = registry.memoize("slow", |n: &u64| {
        std::thread::sleep(Duration::from_millis(100));
        n + 1
    });

    let start = Instant::now();
    for _ in 0..5 {
        assert_eq!(slow.call(&41).unwrap(), 42);
    }
    assert!(start.elapsed() < Duration::from_millis(300));
}

#[test]
fn test_map_argument_order_does_not_change_key() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let calls = AtomicUsize::new(0);
    let total = registry.memoize("total", |kwargs: &HashMap<String, i64>| {
        calls.fetch_add(1, Ordering::SeqCst);
        kwargs.values().sum::<i64>()
    });

    let mut forward = HashMap::new();
    forward.insert("a".to_string(), 1);
    forward.insert("b".to_string(), 2);
    forward.insert("c".to_string(), 3);
    let mut backward = HashMap::new();
    backward.insert("c".to_string(), 3);
    backward.insert("b".to_string(), 2);
    backward.insert("a".to_string(), 1);

    assert_eq!(total.key_for(&forward).unwrap(), total.key_for(&backward).unwrap());
    assert_eq!(total.call(&forward).unwrap(), 6);
    assert_eq!(total.call(&backward).unwrap(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_and_negative_validity_always_recompute() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    for (name, validity) in [("zero", Validity::seconds(0.0)), ("negative", Validity::seconds(-5.0))] {
        let calls = AtomicUsize::new(0);
        let f = registry
            .cached(CacheOptions::new().with_validity(validity))
            .wrap(name, |_: &()| calls.fetch_add(1, Ordering::SeqCst));
        assert_eq!(f.call(&()).unwrap(), 0);
        assert_eq!(f.call(&()).unwrap(), 1);

        // Writes still happen.
        let key = f.key_for(&()).unwrap();
        assert!(f.store().unwrap().contains_key(key.as_str()).unwrap());
    }
}

#[test]
fn test_computations_at_one_location_share_a_store() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let double = registry.memoize("double", |n: &i32| n * 2);
    let triple = registry.memoize("triple", |n: &i32| n * 3);

    assert_eq!(double.call(&2).unwrap(), 4);
    assert_eq!(triple.call(&2).unwrap(), 6);
    assert!(double.store().unwrap().ptr_eq(&triple.store().unwrap()));
    assert_eq!(double.store().unwrap().len(), 2);
}

#[test]
fn test_synthetic_location_uses_escaped_file_name() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let f = registry
        .cached(CacheOptions::new())
        .at(StoreLocation::synthetic("<string>"))
        .wrap("f", |n: &i32| *n);
    f.call(&1).unwrap();

    assert!(dir.path().join("._lt_string_gt_.cache").is_file());
}

#[test]
fn test_method_results_depend_on_instance() {
    #[derive(serde::Serialize)]
    struct Greeter {
        greeting: String,
    }

    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let calls = AtomicUsize::new(0);
    let greet = registry
        .cached(CacheOptions::new())
        .wrap_method("greet", |g: &Greeter, name: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            format!("{}, {name}", g.greeting)
        });

    let hello = Greeter { greeting: "Hello".into() };
    let hi = Greeter { greeting: "Hi".into() };
    let bound = greet.bind(&hello);
    assert_eq!(bound.call("Ada").unwrap(), "Hello, Ada");
    assert_eq!(bound.call("Ada").unwrap(), "Hello, Ada");
    assert_eq!(greet.bind(&hi).call("Ada").unwrap(), "Hi, Ada");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_non_json_results_are_cached() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let calls = AtomicUsize::new(0);
    let grid = registry.memoize("grid", |n: &u8| {
        calls.fetch_add(1, Ordering::SeqCst);
        (0..*n)
            .map(|i| ((i, i), u32::from(i) * 10))
            .collect::<std::collections::BTreeMap<(u8, u8), u32>>()
    });

    let first = grid.call(&3).unwrap();
    let second = grid.call(&3).unwrap();
    assert_eq!(first, second);
    assert_eq!(second.get(&(2, 2)), Some(&20));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_non_finite_results_are_cached() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let calls = AtomicUsize::new(0);
    let ratio = registry.memoize("ratio", |d: &i32| {
        calls.fetch_add(1, Ordering::SeqCst);
        1.0 / f64::from(*d)
    });
    let nan = registry.memoize("nan", |_: &u8| f64::NAN);

    for _ in 0..2 {
        let x = ratio.call(&0).unwrap();
        assert!(x.is_infinite() && x.is_sign_positive());
    }
    assert!((ratio.call(&4).unwrap() - 0.25).abs() < f64::EPSILON);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(nan.call(&1).unwrap().is_nan());
    assert!(nan.call(&1).unwrap().is_nan());
}

#[test]
fn test_nested_option_results_are_not_flattened() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let calls = AtomicUsize::new(0);
    let lookup = registry.memoize("lookup", |n: &u8| {
        calls.fetch_add(1, Ordering::SeqCst);
        match n {
            0 => None,
            1 => Some(None),
            n => Some(Some(i32::from(*n))),
        }
    });

    for n in 0..3 {
        let first = lookup.call(&n).unwrap();
        assert_eq!(lookup.call(&n).unwrap(), first);
    }
    assert_eq!(lookup.call(&1).unwrap(), Some(None));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_non_finite_arguments_do_not_share_results() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let is_inf = registry.memoize("is_inf", |x: &f64| x.is_infinite());

    assert!(is_inf.call(&f64::NEG_INFINITY).unwrap());
    assert!(!is_inf.call(&f64::NAN).unwrap());
    assert!(is_inf.call(&f64::INFINITY).unwrap());
    assert!(!is_inf.call(&f64::NAN).unwrap());
}

#[test]
fn test_manual_invalidation() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir);
    let calls = AtomicUsize::new(0);
    let f = registry.memoize("f", |n: &i32| {
        calls.fetch_add(1, Ordering::SeqCst);
        *n
    });
    f.call(&1).unwrap();
    f.call(&2).unwrap();

    let key = filecache::args_key("f", &1).unwrap();
    assert_eq!(key, f.key_for(&1).unwrap());
    assert!(f.store().unwrap().remove(key.as_str()).unwrap());
    f.call(&1).unwrap();
    f.call(&2).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let removed = f
        .store()
        .unwrap()
        .retain(|key, _| !key.starts_with("f:"))
        .unwrap();
    assert_eq!(removed, 2);
}
