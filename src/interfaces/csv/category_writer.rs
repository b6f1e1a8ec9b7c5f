use crate::domain::budget::BudgetCategory;
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct CategoryRow<'a> {
    category: &'a str,
    participant: &'a str,
    code: &'a str,
    allocated: Decimal,
    spent: Decimal,
    remaining: Decimal,
}

/// Writes category balances as CSV, one row per category.
pub struct CategoryWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CategoryWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_categories(&mut self, categories: &[BudgetCategory]) -> Result<()> {
        for category in categories {
            self.writer.serialize(CategoryRow {
                category: &category.id,
                participant: &category.participant_id,
                code: &category.category_code,
                allocated: category.allocated_amount.value(),
                spent: category.spent_amount.value(),
                remaining: category.remaining_amount.value(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::budget::Balance;
    use rust_decimal_macros::dec;

    #[test]
    fn test_writes_header_and_rows() {
        let mut category =
            BudgetCategory::new("cat-1", "plan-1", "p-1", "transport", Balance(dec!(500)));
        category.spent_amount = Balance(dec!(120.50));
        category.remaining_amount = Balance(dec!(379.50));

        let mut out = Vec::new();
        CategoryWriter::new(&mut out)
            .write_categories(&[category])
            .unwrap();
        let text = String::from_utf8(out).unwrap();

        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("category,participant,code,allocated,spent,remaining")
        );
        assert_eq!(lines.next(), Some("cat-1,p-1,transport,500,120.50,379.50"));
    }
}
