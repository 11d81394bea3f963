//! Who paid whom, from a transaction's before/after balances.
//!
//! A transaction is a receipt for `target` when the target's balance went
//! up. The counterparty is the first *other* account, in account order,
//! whose balance went down by any amount.
//!
//! This is a heuristic. With several debits in one transaction (a fee
//! payer distinct from the sender, a multi-instruction swap) the first
//! debit may not be the real payer. Callers should treat the counterparty
//! as a best guess.

use std::collections::HashMap;

use super::ledger::{TokenBalance, TransactionDetail};

/// One account's balance before and after, in base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    /// Account (or owner, for token balances).
    pub account: String,
    /// Balance before.
    pub pre: u64,
    /// Balance after.
    pub post: u64,
}

impl BalanceChange {
    /// Signed difference `post - pre`.
    pub fn delta(&self) -> i128 {
        self.post as i128 - self.pre as i128
    }
}

/// An attributed incoming transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Amount received, in base units.
    pub amount: u64,
    /// Best-guess sender.
    pub counterparty: String,
}

/// Native balance changes, in account order.
///
/// Returns `None` when the balance arrays do not line up with the account
/// keys (metadata missing or truncated).
pub fn native_changes(detail: &TransactionDetail) -> Option<Vec<BalanceChange>> {
    let n = detail.account_keys.len();
    if n == 0 || detail.pre_balances.len() != n || detail.post_balances.len() != n {
        return None;
    }
    Some(
        detail
            .account_keys
            .iter()
            .zip(detail.pre_balances.iter().zip(&detail.post_balances))
            .map(|(account, (&pre, &post))| BalanceChange {
                account: account.clone(),
                pre,
                post,
            })
            .collect(),
    )
}

/// Token balance changes for `mint`, summed per owner.
///
/// Owners are ordered by the lowest account index of any of their token
/// accounts, so the result follows account order like [`native_changes`].
/// Token accounts created or closed by the transaction count as zero on
/// the missing side.
pub fn token_changes(detail: &TransactionDetail, mint: &str) -> Vec<BalanceChange> {
    // owner -> (first account index, pre, post)
    let mut by_owner: HashMap<String, (usize, u64, u64)> = HashMap::new();

    let mut add = |balances: &[TokenBalance], is_post: bool| {
        for balance in balances.iter().filter(|b| b.mint == mint) {
            let owner = match &balance.owner {
                Some(owner) => owner.clone(),
                None => match detail.account_keys.get(balance.account_index) {
                    Some(key) => key.clone(),
                    None => continue,
                },
            };
            let entry = by_owner
                .entry(owner)
                .or_insert((balance.account_index, 0, 0));
            entry.0 = entry.0.min(balance.account_index);
            if is_post {
                entry.2 = entry.2.saturating_add(balance.amount);
            } else {
                entry.1 = entry.1.saturating_add(balance.amount);
            }
        }
    };
    add(&detail.pre_token_balances, false);
    add(&detail.post_token_balances, true);

    let mut changes: Vec<(usize, BalanceChange)> = by_owner
        .into_iter()
        .map(|(account, (index, pre, post))| (index, BalanceChange { account, pre, post }))
        .collect();
    changes.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.account.cmp(&b.1.account)));
    changes.into_iter().map(|(_, change)| change).collect()
}

/// Applies the receipt heuristic to a list of changes.
pub fn attribute(changes: &[BalanceChange], target: &str) -> Option<Receipt> {
    let received = changes.iter().find(|c| c.account == target)?.delta();
    if received <= 0 {
        return None;
    }
    let sender = changes
        .iter()
        .find(|c| c.account != target && c.delta() < 0)?;

    Some(Receipt {
        amount: u64::try_from(received).ok()?,
        counterparty: sender.account.clone(),
    })
}
