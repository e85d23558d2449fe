use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use memostash::{ArtifactPaths, Computation, ComputeContext, Memoizer, Rejection, Version};

/// Counts how often a computation actually ran.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// `add(a, b)`, optionally taking its time.
#[derive(Debug, Clone)]
pub struct Adder {
    pub version: Version,
    pub delay: Duration,
    pub counter: Counter,
}

impl Adder {
    pub fn new(counter: &Counter) -> Self {
        Adder {
            version: Version::from(1),
            delay: Duration::ZERO,
            counter: counter.clone(),
        }
    }
}

impl Computation for Adder {
    type Args = (i64, i64);
    type Output = i64;

    fn version(&self) -> Version {
        self.version.clone()
    }

    fn compute<'a>(
        &'a self,
        _ctx: &'a ComputeContext,
        args: &'a (i64, i64),
    ) -> BoxFuture<'a, Result<i64, Rejection>> {
        async move {
            self.counter.hit();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(args.0 + args.1)
        }
        .boxed()
    }
}

pub fn adder(cache_dir: &Path, counter: &Counter) -> Memoizer<Adder> {
    Memoizer::new(cache_dir, Adder::new(counter)).unwrap()
}

/// Reads a file and reports its length, observing the file.
#[derive(Debug, Clone)]
pub struct FileLen {
    pub counter: Counter,
}

impl Computation for FileLen {
    type Args = PathBuf;
    type Output = usize;

    fn version(&self) -> Version {
        Version::from("file-len-1")
    }

    fn compute<'a>(
        &'a self,
        ctx: &'a ComputeContext,
        path: &'a PathBuf,
    ) -> BoxFuture<'a, Result<usize, Rejection>> {
        async move {
            self.counter.hit();
            let contents = tokio::fs::read(ctx.observe(path)).await?;
            Ok(contents.len())
        }
        .boxed()
    }
}

/// A report with a field that does not survive serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub total: u32,
    #[serde(skip)]
    pub scratch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Reporter {
    pub consistent: bool,
    pub counter: Counter,
}

impl Computation for Reporter {
    type Args = u32;
    type Output = Report;

    fn version(&self) -> Version {
        Version::from(3)
    }

    fn compute<'a>(
        &'a self,
        _ctx: &'a ComputeContext,
        args: &'a u32,
    ) -> BoxFuture<'a, Result<Report, Rejection>> {
        async move {
            self.counter.hit();
            Ok(Report {
                total: args * 10,
                scratch: Some("only in memory".into()),
            })
        }
        .boxed()
    }

    fn output_consistency(&self) -> bool {
        self.consistent
    }
}

/// Divides two numbers, producing `NaN` for `0 / 0`.
#[derive(Debug, Clone)]
pub struct Ratio {
    pub consistent: bool,
    pub counter: Counter,
}

impl Computation for Ratio {
    type Args = (f64, f64);
    type Output = f64;

    fn version(&self) -> Version {
        Version::from(1)
    }

    fn compute<'a>(
        &'a self,
        _ctx: &'a ComputeContext,
        args: &'a (f64, f64),
    ) -> BoxFuture<'a, Result<f64, Rejection>> {
        self.counter.hit();
        futures::future::ready(Ok(args.0 / args.1)).boxed()
    }

    fn output_consistency(&self) -> bool {
        self.consistent
    }
}

/// Always fails, with a structured error or a plain value.
#[derive(Debug, Clone)]
pub struct Failing {
    pub counter: Counter,
}

impl Computation for Failing {
    type Args = String;
    type Output = String;

    fn version(&self) -> Version {
        Version::from(1)
    }

    fn compute<'a>(
        &'a self,
        _ctx: &'a ComputeContext,
        args: &'a String,
    ) -> BoxFuture<'a, Result<String, Rejection>> {
        async move {
            self.counter.hit();
            if args == "value" {
                return Err(Rejection::value(serde_json::json!({"code": 42})));
            }
            Err(Rejection::error("ParseError", format!("cannot parse {args:?}"))
                .with_property("line", 7))
        }
        .boxed()
    }
}

/// Writes its output into an artifact and hands out the artifact contents.
#[derive(Debug, Clone)]
pub struct Render {
    pub counter: Counter,
}

impl Computation for Render {
    type Args = String;
    /// The artifact path while computing, the rendered text once post-processed.
    type Output = String;

    fn version(&self) -> Version {
        Version::from(1)
    }

    fn compute<'a>(
        &'a self,
        ctx: &'a ComputeContext,
        args: &'a String,
    ) -> BoxFuture<'a, Result<String, Rejection>> {
        async move {
            self.counter.hit();
            let path = ctx.cache_path("rendered.txt");
            tokio::fs::write(&path, args.to_uppercase()).await?;
            Ok(path.to_string_lossy().into_owned())
        }
        .boxed()
    }

    fn post_process<'a>(
        &'a self,
        paths: &'a ArtifactPaths,
        _args: &'a String,
        value: String,
    ) -> BoxFuture<'a, Result<String, Rejection>> {
        async move {
            assert_eq!(PathBuf::from(&value), paths.cache_path("rendered.txt"));
            Ok(tokio::fs::read_to_string(value).await?)
        }
        .boxed()
    }
}
