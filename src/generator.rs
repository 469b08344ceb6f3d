//! Named producers of column default values.
//!
//! A column whose default is [`ColumnDefault::Generated`] asks the registry
//! for a fresh value on every insert that omits it. Nothing is cached: two
//! inserts get two produced values.
//!
//! [`ColumnDefault::Generated`]: crate::models::ColumnDefault::Generated

use crate::executor::{TaskExecutor, acquire_read, acquire_write};
use crate::models::Value;
use crate::{Error, Result};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, RwLock};

type SyncProducer = Arc<dyn Fn() -> Result<Value> + Send + Sync>;
type AsyncProducer = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
enum Producer {
    Inline(SyncProducer),
    Blocking(SyncProducer),
    Async(AsyncProducer),
}

/// A named zero-argument value producer.
#[derive(Clone)]
pub struct Generator {
    name: String,
    producer: Producer,
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.producer {
            Producer::Inline(_) => "inline",
            Producer::Blocking(_) => "blocking",
            Producer::Async(_) => "async",
        };
        f.debug_struct("Generator")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

impl Generator {
    /// A cheap producer run inline on the inserting task.
    pub fn new<F>(name: impl Into<String>, produce: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            producer: Producer::Inline(Arc::new(produce)),
        }
    }

    /// A producer that blocks; it runs on the blocking pool.
    pub fn blocking<F>(name: impl Into<String>, produce: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            producer: Producer::Blocking(Arc::new(produce)),
        }
    }

    /// An async producer.
    pub fn asynchronous<F, Fut>(name: impl Into<String>, produce: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            producer: Producer::Async(Arc::new(move || -> BoxFuture<'static, Result<Value>> {
                Box::pin(produce())
            })),
        }
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Produces one value.
    pub async fn produce(&self, executor: &TaskExecutor) -> Result<Value> {
        match &self.producer {
            Producer::Inline(produce) => produce(),
            Producer::Blocking(produce) => {
                let produce = Arc::clone(produce);
                executor.spawn(move || produce()).await
            },
            Producer::Async(produce) => produce().await,
        }
    }
}

/// Process-wide lookup of generators by name.
#[derive(Debug)]
pub struct GeneratorRegistry {
    generators: RwLock<HashMap<String, Generator>>,
    executor: TaskExecutor,
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneratorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            generators: RwLock::new(HashMap::new()),
            executor: TaskExecutor::new("generators"),
        }
    }

    /// A registry holding `uuid4`, `uuid7`, and `now`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for generator in builtin_generators() {
            registry.replace(generator);
        }
        registry
    }

    /// Registers a generator under its name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the name is already taken.
    pub fn register(&self, generator: Generator) -> Result<()> {
        let mut generators = acquire_write(&self.generators);
        if generators.contains_key(generator.name()) {
            return Err(Error::InvalidInput(format!(
                "generator '{}' is already registered",
                generator.name()
            )));
        }
        generators.insert(generator.name.clone(), generator);
        Ok(())
    }

    /// Registers a generator, returning the one it displaced.
    pub fn replace(&self, generator: Generator) -> Option<Generator> {
        acquire_write(&self.generators).insert(generator.name.clone(), generator)
    }

    /// Removes a generator.
    pub fn unregister(&self, name: &str) -> Option<Generator> {
        acquire_write(&self.generators).remove(name)
    }

    /// Looks up a generator.
    pub fn resolve(&self, name: &str) -> Option<Generator> {
        acquire_read(&self.generators).get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        acquire_read(&self.generators).contains_key(name)
    }

    /// Produces a fresh value from the generator called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConstraintViolation`] if no such generator exists, or
    /// whatever the producer returns.
    pub async fn produce(&self, name: &str) -> Result<Value> {
        let generator = self.resolve(name).ok_or_else(|| {
            Error::ConstraintViolation(format!("no generator named '{name}' is registered"))
        })?;
        generator.produce(&self.executor).await
    }
}

fn builtin_generators() -> [Generator; 3] {
    [
        Generator::new("uuid4", || Ok(Value::Text(uuid::Uuid::new_v4().to_string()))),
        Generator::new("uuid7", || Ok(Value::Text(uuid::Uuid::now_v7().to_string()))),
        Generator::new("now", || {
            Ok(Value::Text(
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            ))
        }),
    ]
}

static GLOBAL_GENERATORS: OnceLock<Arc<GeneratorRegistry>> = OnceLock::new();

/// Returns the process-wide generator registry, with builtins, initializing it on first use.
#[must_use]
pub fn global_generators() -> &'static Arc<GeneratorRegistry> {
    GLOBAL_GENERATORS.get_or_init(|| Arc::new(GeneratorRegistry::with_builtins()))
}
