//! Pure balance arithmetic for transactions.
//!
//! `apply` and `reverse` compute the signed account deltas a transaction
//! implies without touching storage. Callers persist the returned effect
//! through [`crate::cache::LocalCache::commit_effect`], which keeps the
//! write paired with the mutation that produced it.

use rust_decimal::Decimal;

use crate::model::{Loan, LoanKind, RecordId, Transaction, TransactionType};

/// Adjustment to a loan's `paidAmount`. Positive means a payment was
/// recorded, negative that one was undone.
#[derive(Debug, Clone, PartialEq)]
pub struct LoanPaymentDelta {
    pub loan_id: RecordId,
    pub amount: Decimal,
}

/// The full balance impact of one transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LedgerEffect {
    pub account_deltas: Vec<(RecordId, Decimal)>,
    pub loan_payment: Option<LoanPaymentDelta>,
}

impl LedgerEffect {
    pub fn is_empty(&self) -> bool {
        self.account_deltas.is_empty() && self.loan_payment.is_none()
    }

    fn negated(mut self) -> Self {
        for (_, delta) in &mut self.account_deltas {
            *delta = -*delta;
        }
        if let Some(payment) = &mut self.loan_payment {
            payment.amount = -payment.amount;
        }
        self
    }
}

/// Effect of recording `tx`. `loans` supplies the loan rows needed to
/// direct loan payments; an unresolvable loan leg is skipped rather than
/// treated as an error.
pub fn apply(tx: &Transaction, loans: &[Loan]) -> LedgerEffect {
    effect_of(tx, loans)
}

/// Exact inverse of [`apply`] for the same inputs, used when a
/// transaction is deleted or replaced.
pub fn reverse(tx: &Transaction, loans: &[Loan]) -> LedgerEffect {
    effect_of(tx, loans).negated()
}

fn effect_of(tx: &Transaction, loans: &[Loan]) -> LedgerEffect {
    let mut effect = LedgerEffect::default();
    let mut push = |account: &Option<RecordId>, delta: Decimal| {
        if let Some(id) = account {
            effect.account_deltas.push((id.clone(), delta));
        }
    };

    match tx.kind {
        TransactionType::Income => push(&tx.account_id, tx.amount),
        TransactionType::Expense => push(&tx.account_id, -tx.amount),
        TransactionType::Transfer => {
            push(&tx.account_id, -tx.amount);
            push(&tx.to_account_id, tx.to_amount.unwrap_or(tx.amount));
        }
        // Investments record a position, not a cash movement, so
        // neither side touches an account balance.
        TransactionType::InvestmentBuy | TransactionType::InvestmentSell => {}
        TransactionType::LoanGiven => push(&tx.account_id, -tx.amount),
        TransactionType::LoanReceived => push(&tx.account_id, tx.amount),
        TransactionType::LoanPayment => {
            let Some(loan_id) = &tx.loan_id else {
                return effect;
            };
            effect.loan_payment = Some(LoanPaymentDelta {
                loan_id: loan_id.clone(),
                amount: tx.main_currency_amount.unwrap_or(tx.amount),
            });
            // The cash direction depends on which side of the loan the
            // user is on, so an unknown loan moves no account money.
            if let Some(loan) = loans.iter().find(|l| &l.id == loan_id) {
                match loan.kind {
                    LoanKind::Given => push(&tx.account_id, tx.amount),
                    LoanKind::Received => push(&tx.account_id, -tx.amount),
                }
            }
        }
    }
    effect
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LoanStatus;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn tx(kind: TransactionType, amount: Decimal) -> Transaction {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Transaction {
            id: RecordId::Permanent(1),
            kind,
            amount,
            currency: "EUR".to_string(),
            date: at,
            comment: None,
            account_id: Some(RecordId::Permanent(10)),
            to_account_id: None,
            to_amount: None,
            income_source_id: None,
            category_id: None,
            loan_id: None,
            main_currency_amount: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn loan(id: i64, kind: LoanKind) -> Loan {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Loan {
            id: RecordId::Permanent(id),
            kind,
            person_name: "Maya".to_string(),
            amount: dec!(500),
            currency: "EUR".to_string(),
            paid_amount: Decimal::ZERO,
            status: LoanStatus::Active,
            account_id: Some(RecordId::Permanent(10)),
            due_date: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn income_credits_and_expense_debits_the_account() {
        let effect = apply(&tx(TransactionType::Income, dec!(1000)), &[]);
        assert_eq!(effect.account_deltas, vec![(RecordId::Permanent(10), dec!(1000))]);

        let effect = apply(&tx(TransactionType::Expense, dec!(300)), &[]);
        assert_eq!(effect.account_deltas, vec![(RecordId::Permanent(10), dec!(-300))]);
    }

    #[test]
    fn transfer_uses_target_amount_when_present() {
        let mut transfer = tx(TransactionType::Transfer, dec!(100));
        transfer.to_account_id = Some(RecordId::Permanent(11));
        transfer.to_amount = Some(dec!(85));

        let effect = apply(&transfer, &[]);
        assert_eq!(
            effect.account_deltas,
            vec![
                (RecordId::Permanent(10), dec!(-100)),
                (RecordId::Permanent(11), dec!(85)),
            ]
        );
    }

    #[test]
    fn transfer_falls_back_to_source_amount() {
        let mut transfer = tx(TransactionType::Transfer, dec!(100));
        transfer.to_account_id = Some(RecordId::Permanent(11));

        let effect = apply(&transfer, &[]);
        assert_eq!(effect.account_deltas[1], (RecordId::Permanent(11), dec!(100)));
    }

    #[test]
    fn missing_account_legs_are_skipped() {
        let mut transfer = tx(TransactionType::Transfer, dec!(100));
        transfer.account_id = None;
        transfer.to_account_id = Some(RecordId::Permanent(11));

        let effect = apply(&transfer, &[]);
        assert_eq!(effect.account_deltas, vec![(RecordId::Permanent(11), dec!(100))]);
    }

    #[test]
    fn investments_never_touch_account_balances() {
        let buy = apply(&tx(TransactionType::InvestmentBuy, dec!(250)), &[]);
        assert!(buy.is_empty());

        let sell = apply(&tx(TransactionType::InvestmentSell, dec!(250)), &[]);
        assert!(sell.is_empty());
        assert!(reverse(&tx(TransactionType::InvestmentSell, dec!(250)), &[]).is_empty());
    }

    #[test]
    fn payment_on_a_given_loan_credits_the_account() {
        let mut payment = tx(TransactionType::LoanPayment, dec!(50));
        payment.loan_id = Some(RecordId::Permanent(5));

        let effect = apply(&payment, &[loan(5, LoanKind::Given)]);
        assert_eq!(effect.account_deltas, vec![(RecordId::Permanent(10), dec!(50))]);
        assert_eq!(
            effect.loan_payment,
            Some(LoanPaymentDelta {
                loan_id: RecordId::Permanent(5),
                amount: dec!(50),
            })
        );
    }

    #[test]
    fn payment_on_a_received_loan_debits_the_account() {
        let mut payment = tx(TransactionType::LoanPayment, dec!(50));
        payment.loan_id = Some(RecordId::Permanent(5));

        let effect = apply(&payment, &[loan(5, LoanKind::Received)]);
        assert_eq!(effect.account_deltas, vec![(RecordId::Permanent(10), dec!(-50))]);
    }

    #[test]
    fn payment_prefers_main_currency_amount_for_the_loan_delta() {
        let mut payment = tx(TransactionType::LoanPayment, dec!(55));
        payment.loan_id = Some(RecordId::Permanent(5));
        payment.main_currency_amount = Some(dec!(50));

        let effect = apply(&payment, &[loan(5, LoanKind::Given)]);
        assert_eq!(effect.loan_payment.unwrap().amount, dec!(50));
        assert_eq!(effect.account_deltas[0].1, dec!(55));
    }

    #[test]
    fn payment_without_a_loan_reference_is_a_no_op() {
        let payment = tx(TransactionType::LoanPayment, dec!(50));
        let effect = apply(&payment, &[loan(5, LoanKind::Given)]);
        assert!(effect.is_empty());
    }

    #[test]
    fn payment_against_an_unknown_loan_moves_no_cash() {
        let mut payment = tx(TransactionType::LoanPayment, dec!(50));
        payment.loan_id = Some(RecordId::Permanent(99));

        let effect = apply(&payment, &[loan(5, LoanKind::Given)]);
        assert!(effect.account_deltas.is_empty());
        assert_eq!(effect.loan_payment.unwrap().loan_id, RecordId::Permanent(99));
    }

    #[test]
    fn reverse_is_the_exact_negation_of_apply() {
        let mut transfer = tx(TransactionType::Transfer, dec!(100));
        transfer.to_account_id = Some(RecordId::Permanent(11));
        transfer.to_amount = Some(dec!(85));

        let forward = apply(&transfer, &[]);
        let backward = reverse(&transfer, &[]);
        for ((id_f, d_f), (id_b, d_b)) in
            forward.account_deltas.iter().zip(&backward.account_deltas)
        {
            assert_eq!(id_f, id_b);
            assert_eq!(*d_f, -*d_b);
        }
    }
}
