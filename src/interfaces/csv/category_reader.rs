use crate::domain::budget::{Balance, BudgetCategory};
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One row of a plan provisioning file.
#[derive(Debug, Deserialize)]
struct CategoryRecord {
    id: String,
    plan_id: String,
    participant_id: String,
    category_code: String,
    allocated: Decimal,
}

impl TryFrom<CategoryRecord> for BudgetCategory {
    type Error = PaymentError;

    fn try_from(record: CategoryRecord) -> Result<Self> {
        if record.allocated < Decimal::ZERO {
            return Err(PaymentError::ValidationError(format!(
                "category '{}' has a negative allocation",
                record.id
            )));
        }
        Ok(BudgetCategory::new(
            record.id,
            record.plan_id,
            record.participant_id,
            record.category_code,
            Balance(record.allocated),
        ))
    }
}

/// Reads budget categories from a CSV source with the header
/// `id, plan_id, participant_id, category_code, allocated`.
pub struct CategoryReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CategoryReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes categories; malformed rows surface as errors
    /// without ending the stream.
    pub fn categories(self) -> impl Iterator<Item = Result<BudgetCategory>> {
        self.reader
            .into_deserialize::<CategoryRecord>()
            .map(|result| {
                result
                    .map_err(PaymentError::from)
                    .and_then(BudgetCategory::try_from)
            })
    }
}
