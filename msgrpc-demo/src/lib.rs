use msgrpc::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicU64, Ordering};

#[msgrpc::service]
pub trait Calculator {
    async fn add(&self, a: i64, b: i64) -> Result<i64>;

    /// Multiplies `value` by `factor`, 2 when left out.
    async fn scale(&self, value: f64, factor: Option<f64>) -> Result<f64>;

    async fn div(&self, a: i64, b: i64) -> Result<i64>;

    /// Number of calls this instance has answered.
    async fn calls(&self) -> Result<u64>;
}

#[derive(Debug, Default)]
pub struct CalculatorImpl {
    calls: AtomicU64,
}

impl CalculatorImpl {
    fn count(&self) -> u64 {
        self.calls.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Calculator for CalculatorImpl {
    async fn add(&self, a: i64, b: i64) -> Result<i64> {
        self.count();
        Ok(a + b)
    }

    async fn scale(&self, value: f64, factor: Option<f64>) -> Result<f64> {
        self.count();
        Ok(value * factor.unwrap_or(2.0))
    }

    async fn div(&self, a: i64, b: i64) -> Result<i64> {
        self.count();
        a.checked_div(b)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, format!("cannot divide {a} by {b}")))
    }

    async fn calls(&self) -> Result<u64> {
        Ok(self.count())
    }
}
