//! Record predicates and a small boolean expression language.
//!
//! Tables accept a [`Filter`] wherever records are selected. A filter wraps
//! anything implementing [`Predicate`]: a plain closure, an async closure, or
//! an [`Expr`] tree built with [`field`] and [`lit`].
//!
//! ```rust,ignore
//! use queuelite::{Filter, field};
//!
//! let adults = Filter::from(field("age").ge(18).and(field("name").is_null().not()));
//! let bobs = Filter::from_fn(|r| r.value("name") == Some(&"Bob".into()));
//! ```

use crate::models::{TableRecord, Value};
use futures_util::future::BoxFuture;
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// An asynchronous yes/no test over one record.
pub trait Predicate: Send + Sync {
    /// Returns whether `record` matches.
    fn test<'a>(&'a self, record: &'a TableRecord) -> BoxFuture<'a, bool>;
}

impl<F> Predicate for F
where
    F: Fn(&TableRecord) -> bool + Send + Sync,
{
    fn test<'a>(&'a self, record: &'a TableRecord) -> BoxFuture<'a, bool> {
        Box::pin(std::future::ready(self(record)))
    }
}

struct AsyncPredicate<F>(F);

impl<F, Fut> Predicate for AsyncPredicate<F>
where
    F: Fn(TableRecord) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn test<'a>(&'a self, record: &'a TableRecord) -> BoxFuture<'a, bool> {
        Box::pin((self.0)(record.clone()))
    }
}

/// Record selection for table operations; the default selects everything.
#[derive(Clone, Default)]
pub struct Filter(Option<Arc<dyn Predicate>>);

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_all() { "Filter(all)" } else { "Filter(predicate)" })
    }
}

impl Filter {
    /// Matches every record.
    #[must_use]
    pub const fn all() -> Self {
        Self(None)
    }

    /// Wraps a predicate.
    pub fn new(predicate: impl Predicate + 'static) -> Self {
        Self(Some(Arc::new(predicate)))
    }

    /// Wraps a synchronous closure.
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&TableRecord) -> bool + Send + Sync + 'static,
    {
        Self::new(predicate)
    }

    /// Wraps an async closure; it receives its own handle on the record.
    pub fn from_async<F, Fut>(predicate: F) -> Self
    where
        F: Fn(TableRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::new(AsyncPredicate(predicate))
    }

    /// Whether this filter selects everything without testing records.
    pub const fn is_all(&self) -> bool {
        self.0.is_none()
    }

    /// Tests one record.
    pub async fn matches(&self, record: &TableRecord) -> bool {
        match &self.0 {
            None => true,
            Some(predicate) => predicate.test(record).await,
        }
    }
}

impl From<Expr> for Filter {
    fn from(expr: Expr) -> Self {
        Self::new(expr)
    }
}

/// Comparison operators of [`Expr::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    fn holds(self, ordering: Option<Ordering>) -> bool {
        let Some(ordering) = ordering else {
            return false;
        };
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// A boolean expression over one record.
///
/// Comparisons follow SQL: anything compared with `NULL` is false, numbers
/// compare across integer and real, and a field the record does not have
/// reads as `NULL`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// The value of a named column.
    Field(String),
    /// A constant.
    Literal(Value),
    /// `left op right`.
    Compare {
        /// Operator.
        op: CompareOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Both sides hold.
    And(Box<Expr>, Box<Expr>),
    /// Either side holds.
    Or(Box<Expr>, Box<Expr>),
    /// The operand does not hold.
    Not(Box<Expr>),
    /// The operand is `NULL`.
    IsNull(Box<Expr>),
}

/// A column reference.
pub fn field(name: impl Into<String>) -> Expr {
    Expr::Field(name.into())
}

/// A constant.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

impl Expr {
    /// Compares with another expression.
    #[must_use]
    pub fn compare(self, op: CompareOp, other: Self) -> Self {
        Self::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// `self = value`
    #[must_use]
    pub fn eq(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Eq, lit(value))
    }

    /// `self != value`
    #[must_use]
    pub fn ne(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Ne, lit(value))
    }

    /// `self < value`
    #[must_use]
    pub fn lt(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Lt, lit(value))
    }

    /// `self <= value`
    #[must_use]
    pub fn le(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Le, lit(value))
    }

    /// `self > value`
    #[must_use]
    pub fn gt(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Gt, lit(value))
    }

    /// `self >= value`
    #[must_use]
    pub fn ge(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Ge, lit(value))
    }

    /// `self AND other`
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// `self IS NULL`
    #[must_use]
    pub fn is_null(self) -> Self {
        Self::IsNull(Box::new(self))
    }

    /// Evaluates to a value; comparisons and connectives yield `0`/`1`.
    #[must_use]
    pub fn evaluate(&self, record: &TableRecord) -> Value {
        match self {
            Self::Field(name) => record.value(name).cloned().unwrap_or_default(),
            Self::Literal(value) => value.clone(),
            _ => Value::from(self.holds(record)),
        }
    }

    /// Evaluates as a condition.
    #[must_use]
    pub fn holds(&self, record: &TableRecord) -> bool {
        match self {
            Self::Field(_) | Self::Literal(_) => truthy(&self.evaluate(record)),
            Self::Compare { op, left, right } => {
                op.holds(left.evaluate(record).compare(&right.evaluate(record)))
            },
            Self::And(a, b) => a.holds(record) && b.holds(record),
            Self::Or(a, b) => a.holds(record) || b.holds(record),
            Self::Not(inner) => !inner.holds(record),
            Self::IsNull(inner) => inner.evaluate(record).is_null(),
        }
    }
}

impl std::ops::Not for Expr {
    type Output = Self;

    fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Integer(i) => *i != 0,
        Value::Real(r) => *r != 0.0,
        Value::Text(s) => !s.is_empty(),
        Value::Blob(b) => !b.is_empty(),
    }
}

impl Predicate for Expr {
    fn test<'a>(&'a self, record: &'a TableRecord) -> BoxFuture<'a, bool> {
        Box::pin(std::future::ready(self.holds(record)))
    }
}
