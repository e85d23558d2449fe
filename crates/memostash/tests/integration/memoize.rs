use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use memostash::{
    CacheStatus, Computation, ComputeContext, EntryState, MemoError, Memoizer, Rejection,
    Version,
};
use memostash_test::{setup, tempdir, touch, write_file};

use crate::utils::{Adder, Counter, Failing, FileLen, Ratio, Render, Report, Reporter, adder};

#[tokio::test]
async fn test_add_survives_restart() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();

    let memoizer = adder(cache_dir.path(), &counter);
    assert_eq!(memoizer.invoke((1, 2)).await.unwrap(), 3);
    assert_eq!(memoizer.invoke((3, 4)).await.unwrap(), 7);
    assert_eq!(memoizer.invoke((1, 2)).await.unwrap(), 3);
    assert_eq!(counter.get(), 2);

    let restarted = Counter::default();
    let memoizer = adder(cache_dir.path(), &restarted);
    assert_eq!(memoizer.invoke((1, 2)).await.unwrap(), 3);
    assert_eq!(restarted.get(), 0);
}

#[tokio::test]
async fn test_cache_dir_is_created() {
    setup();
    let tmp = tempdir();
    let cache_dir = tmp.path().join("nested/cache");
    let counter = Counter::default();

    let memoizer = adder(&cache_dir, &counter);
    assert!(!cache_dir.exists());

    memoizer.invoke((5, 5)).await.unwrap();
    assert!(cache_dir.is_dir());
    assert_eq!(memoizer.store().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_version_change_recomputes() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();

    let v1 = Memoizer::new(cache_dir.path(), Adder::new(&counter)).unwrap();
    v1.invoke((1, 2)).await.unwrap();

    let v2 = Memoizer::new(
        cache_dir.path(),
        Adder {
            version: Version::from(2),
            ..Adder::new(&counter)
        },
    )
    .unwrap();
    let call = v2.call((1, 2)).unwrap();
    assert_eq!(call.checked().await, Some(CacheStatus::Miss));
    assert_eq!(call.await.unwrap(), 3);
    assert_eq!(counter.get(), 2);

    // the text form of a number is the same version
    let text = Memoizer::new(
        cache_dir.path(),
        Adder {
            version: Version::from("1"),
            ..Adder::new(&counter)
        },
    )
    .unwrap();
    text.invoke((1, 2)).await.unwrap();
    assert_eq!(counter.get(), 2);
}

#[tokio::test]
async fn test_invalid_version() {
    let cache_dir = tempdir();
    let counter = Counter::default();

    let err = Memoizer::new(
        cache_dir.path(),
        Adder {
            version: Version::from(f64::NAN),
            ..Adder::new(&counter)
        },
    )
    .unwrap_err();
    assert!(matches!(err, MemoError::InvalidVersion(_)));
}

#[tokio::test]
async fn test_observed_file_changes() {
    setup();
    let cache_dir = tempdir();
    let inputs = tempdir();
    let input = inputs.path().join("input.txt");
    write_file(&input, "hello");

    let counter = Counter::default();
    let memoizer = Memoizer::new(
        cache_dir.path(),
        FileLen {
            counter: counter.clone(),
        },
    )
    .unwrap();

    assert_eq!(memoizer.invoke(input.clone()).await.unwrap(), 5);
    assert_eq!(memoizer.invoke(input.clone()).await.unwrap(), 5);
    assert_eq!(counter.get(), 1);

    // a new modification time alone invalidates the entry
    touch(&input, 10).unwrap();
    assert_eq!(memoizer.invoke(input.clone()).await.unwrap(), 5);
    assert_eq!(counter.get(), 2);

    write_file(&input, "hello world");
    assert_eq!(memoizer.invoke(input.clone()).await.unwrap(), 11);
    assert_eq!(counter.get(), 3);

    // reading a missing file fails, and the failure is cached
    std::fs::remove_file(&input).unwrap();
    let err = memoizer.invoke(input.clone()).await.unwrap_err();
    assert_eq!(err.rejection().unwrap().as_error().unwrap().name, "Error");
    memoizer.invoke(input.clone()).await.unwrap_err();
    assert_eq!(counter.get(), 4);

    // until the file appears again
    write_file(&input, "back");
    assert_eq!(memoizer.invoke(input.clone()).await.unwrap(), 4);
    assert_eq!(counter.get(), 5);
}

#[tokio::test]
async fn test_untouched_files_stay_cached() {
    setup();
    let cache_dir = tempdir();
    let inputs = tempdir();
    let a = inputs.path().join("a.txt");
    let b = inputs.path().join("b.txt");
    write_file(&a, "a");
    write_file(&b, "bb");

    let counter = Counter::default();
    let memoizer = Memoizer::new(
        cache_dir.path(),
        FileLen {
            counter: counter.clone(),
        },
    )
    .unwrap();

    memoizer.invoke(a.clone()).await.unwrap();
    memoizer.invoke(b.clone()).await.unwrap();
    touch(&b, 10).unwrap();

    assert_eq!(memoizer.invoke(a).await.unwrap(), 1);
    assert_eq!(counter.get(), 2);
    assert_eq!(memoizer.invoke(b).await.unwrap(), 2);
    assert_eq!(counter.get(), 3);
}

#[tokio::test]
async fn test_concurrent_calls_share_computation() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = Memoizer::new(
        cache_dir.path(),
        Adder {
            delay: Duration::from_millis(50),
            ..Adder::new(&counter)
        },
    )
    .unwrap();

    let first = memoizer.call((20, 22)).unwrap();
    let second = memoizer.call((20, 22)).unwrap();
    let other = memoizer.call((1, 1)).unwrap();
    assert_eq!(first.key(), second.key());
    assert_ne!(first.key(), other.key());

    assert_eq!(first.await.unwrap(), 42);
    assert_eq!(second.await.unwrap(), 42);
    assert_eq!(other.await.unwrap(), 2);
    assert_eq!(counter.get(), 2);

    // once settled, a new call is answered from the cache
    assert_eq!(memoizer.invoke((20, 22)).await.unwrap(), 42);
    assert_eq!(counter.get(), 2);
}

#[tokio::test]
async fn test_fresh_and_cached_values_are_equal() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = Memoizer::new(
        cache_dir.path(),
        Reporter {
            consistent: true,
            counter: counter.clone(),
        },
    )
    .unwrap();

    let fresh = memoizer.invoke(4).await.unwrap();
    let cached = memoizer.invoke(4).await.unwrap();
    assert_eq!(
        fresh,
        Report {
            total: 40,
            scratch: None
        }
    );
    assert_eq!(fresh, cached);
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_without_output_consistency() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = Memoizer::new(
        cache_dir.path(),
        Reporter {
            consistent: false,
            counter: counter.clone(),
        },
    )
    .unwrap();

    let fresh = memoizer.invoke(4).await.unwrap();
    let cached = memoizer.invoke(4).await.unwrap();
    assert_eq!(fresh.scratch.as_deref(), Some("only in memory"));
    assert_eq!(cached.scratch, None);
    assert_eq!(fresh.total, cached.total);
}

#[tokio::test]
async fn test_rejections_are_memoized() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = Memoizer::new(
        cache_dir.path(),
        Failing {
            counter: counter.clone(),
        },
    )
    .unwrap();

    let fresh = memoizer.invoke("x = ".into()).await.unwrap_err();
    let cached = memoizer.invoke("x = ".into()).await.unwrap_err();
    assert_eq!(counter.get(), 1);

    let error = cached.rejection().unwrap().as_error().unwrap();
    assert_eq!(error.name, "ParseError");
    assert_eq!(error.message, r#"cannot parse "x = ""#);
    assert_eq!(error.properties["line"], 7);
    assert_eq!(fresh.rejection(), cached.rejection());

    let cached_value = {
        memoizer.invoke("value".into()).await.unwrap_err();
        memoizer.invoke("value".into()).await.unwrap_err()
    };
    assert_eq!(
        cached_value.rejection(),
        Some(&Rejection::value(serde_json::json!({"code": 42})))
    );
    assert_eq!(counter.get(), 2);
}

#[tokio::test]
async fn test_post_process_reads_artifacts() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = Memoizer::new(
        cache_dir.path(),
        Render {
            counter: counter.clone(),
        },
    )
    .unwrap();

    assert_eq!(memoizer.invoke("hi".into()).await.unwrap(), "HI");
    assert_eq!(memoizer.invoke("hi".into()).await.unwrap(), "HI");
    assert_eq!(counter.get(), 1);

    let entries = memoizer.store().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].artifacts, 1);
}

#[tokio::test]
async fn test_corrupt_record_recomputes() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = adder(cache_dir.path(), &counter);

    let key = memoizer.cache_key(&(2, 2)).unwrap();
    write_file(memoizer.store().record_path(&key), "not json at all");

    assert_eq!(memoizer.invoke((2, 2)).await.unwrap(), 4);
    assert_eq!(counter.get(), 1);
    assert_eq!(memoizer.invoke((2, 2)).await.unwrap(), 4);
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_record_of_other_type_recomputes() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = adder(cache_dir.path(), &counter);

    let key = memoizer.cache_key(&(2, 3)).unwrap();
    write_file(
        memoizer.store().record_path(&key),
        r#"{"state":"fulfilled","value":"five","observedFiles":[]}"#,
    );

    assert_eq!(memoizer.invoke((2, 3)).await.unwrap(), 5);
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_storage_error_is_not_computed() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = adder(cache_dir.path(), &counter);

    let key = memoizer.cache_key(&(1, 2)).unwrap();
    std::fs::create_dir_all(memoizer.store().record_path(&key)).unwrap();

    let err = memoizer.invoke((1, 2)).await.unwrap_err();
    assert!(matches!(err, MemoError::Storage { .. }), "{err:?}");
    assert_eq!(counter.get(), 0);

    // other keys are unaffected
    assert_eq!(memoizer.invoke((2, 2)).await.unwrap(), 4);
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn test_nan_output_is_memoized() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = Memoizer::new(
        cache_dir.path(),
        Ratio {
            consistent: true,
            counter: counter.clone(),
        },
    )
    .unwrap();

    let fresh = memoizer.invoke((0.0, 0.0)).await.unwrap_err();
    let cached = memoizer.invoke((0.0, 0.0)).await.unwrap_err();
    assert_eq!(counter.get(), 1);

    assert_eq!(fresh.rejection(), cached.rejection());
    assert_eq!(cached.rejection().unwrap().as_error().unwrap().name, "EncodingError");

    let entries = memoizer.store().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, EntryState::Rejected);

    assert_eq!(memoizer.invoke((1.0, 4.0)).await.unwrap(), 0.25);
    assert_eq!(counter.get(), 2);
}

#[tokio::test]
async fn test_nan_output_without_consistency() {
    setup();
    let cache_dir = tempdir();
    let counter = Counter::default();
    let memoizer = Memoizer::new(
        cache_dir.path(),
        Ratio {
            consistent: false,
            counter: counter.clone(),
        },
    )
    .unwrap();

    let fresh = memoizer.invoke((0.0, 0.0)).await.unwrap();
    assert!(fresh.is_nan());

    let cached = memoizer.invoke((0.0, 0.0)).await.unwrap_err();
    assert!(cached.rejection().is_some());
    assert_eq!(counter.get(), 1);
}

/// Arguments with map keys JSON cannot express.
struct Tally;

impl Computation for Tally {
    type Args = BTreeMap<(u8, u8), u32>;
    type Output = u32;

    fn version(&self) -> Version {
        Version::from(1)
    }

    fn compute<'a>(
        &'a self,
        _ctx: &'a ComputeContext,
        args: &'a Self::Args,
    ) -> BoxFuture<'a, Result<u32, Rejection>> {
        futures::future::ready(Ok(args.values().sum())).boxed()
    }
}

#[tokio::test]
async fn test_unrepresentable_input() {
    let cache_dir = tempdir();
    let memoizer = Memoizer::new(cache_dir.path(), Tally).unwrap();

    let args = BTreeMap::from([((1, 2), 3)]);
    let err = memoizer.call(args).unwrap_err();
    assert!(matches!(err, MemoError::InvalidInput(_)));
    assert!(memoizer.used_keys().is_empty());
}
