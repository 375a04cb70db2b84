use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Realized loss for one UTC trading day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLossAccumulator {
    pub date: NaiveDate,
    pub loss_usd: Decimal,
}

impl DailyLossAccumulator {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            date: today,
            loss_usd: Decimal::ZERO,
        }
    }

    /// Reset to zero when the stored date is not today
    fn ensure_daily_reset(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.date != today {
            *self = Self::new(today);
        }
    }

    /// Current loss, rolling the day over first
    pub fn current_at(&mut self, now: DateTime<Utc>) -> Decimal {
        self.ensure_daily_reset(now);
        self.loss_usd
    }

    /// Add a loss (sign ignored) and return the new total
    pub fn add_loss_at(&mut self, loss: Decimal, now: DateTime<Utc>) -> Decimal {
        self.ensure_daily_reset(now);
        self.loss_usd += loss.abs();
        self.loss_usd
    }

    /// Loss as it would read at `now`, without rolling the stored value
    pub fn peek_at(&self, now: DateTime<Utc>) -> Decimal {
        if self.date == now.date_naive() {
            self.loss_usd
        } else {
            Decimal::ZERO
        }
    }
}
