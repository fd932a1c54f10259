//! Ledger collaborator
//!
//! [`LedgerClient`] is everything the registry needs from the chain that
//! finalizes its transactions: atomic submission, receipts, the event log,
//! the head block and token balances.
//!
//! [`LocalChain`] is an in-memory implementation. It mines one block per
//! transaction, keeps a manual clock, and can be switched offline or fed
//! duplicate log entries to exercise the synchronizer.

use crate::types::{
    Address, BlockHeader, BlockRange, LogEntry, Receipt, TokenAmount, Transaction, Transfer,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Chain access used by the registry and the synchronizer
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a transaction; transfers and event commit atomically
    async fn submit(&self, tx: Transaction) -> Result<Receipt>;

    /// Receipt of a previously submitted transaction, if it committed
    async fn receipt(&self, tx_id: Uuid) -> Result<Option<Receipt>>;

    /// Registry log entries in a block range, in any order
    async fn get_logs(&self, range: BlockRange) -> Result<Vec<LogEntry>>;

    /// Current head
    async fn current_block(&self) -> Result<BlockHeader>;

    /// Token balance
    async fn balance_of(&self, token: Address, account: Address) -> Result<TokenAmount>;

    /// Token allowance granted by `owner` to `spender`
    async fn allowance(&self, token: Address, owner: Address, spender: Address)
        -> Result<TokenAmount>;

    /// Plain transfer signed by `from`
    async fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: TokenAmount,
    ) -> Result<Receipt>;
}

#[derive(Debug)]
struct ChainState {
    blocks: Vec<BlockHeader>,
    logs: Vec<LogEntry>,
    balances: HashMap<(Address, Address), TokenAmount>,
    allowances: HashMap<(Address, Address, Address), TokenAmount>,
    receipts: HashMap<Uuid, Receipt>,
}

impl ChainState {
    fn head(&self) -> &BlockHeader {
        // Genesis is created in `LocalChain::new` and blocks are never removed
        &self.blocks[self.blocks.len() - 1]
    }

    fn mine(&mut self, timestamp: u64, tx_ids: &[Uuid]) -> BlockHeader {
        let parent = self.head().clone();
        let header = BlockHeader {
            number: parent.number + 1,
            timestamp,
            hash: block_hash(parent.number + 1, timestamp, &parent.hash, tx_ids),
            parent_hash: parent.hash,
        };
        self.blocks.push(header.clone());
        header
    }

    /// Compute post-transfer balances without touching state
    fn simulate(
        &self,
        token: Address,
        spender: Address,
        transfers: &[Transfer],
    ) -> Result<(
        HashMap<(Address, Address), TokenAmount>,
        HashMap<(Address, Address, Address), TokenAmount>,
    )> {
        let mut balances: HashMap<(Address, Address), TokenAmount> = HashMap::new();
        let mut allowances: HashMap<(Address, Address, Address), TokenAmount> = HashMap::new();

        for transfer in transfers {
            if transfer.from != spender {
                let key = (token, transfer.from, spender);
                let available = *allowances
                    .get(&key)
                    .or_else(|| self.allowances.get(&key))
                    .unwrap_or(&0);
                if available < transfer.amount {
                    return Err(Error::InsufficientAllowance {
                        owner: transfer.from,
                        spender,
                        available,
                        required: transfer.amount,
                    });
                }
                allowances.insert(key, available - transfer.amount);
            }

            let from_key = (token, transfer.from);
            let available = *balances
                .get(&from_key)
                .or_else(|| self.balances.get(&from_key))
                .unwrap_or(&0);
            if available < transfer.amount {
                return Err(Error::InsufficientBalance {
                    account: transfer.from,
                    available,
                    required: transfer.amount,
                });
            }
            balances.insert(from_key, available - transfer.amount);

            let to_key = (token, transfer.to);
            let current = *balances
                .get(&to_key)
                .or_else(|| self.balances.get(&to_key))
                .unwrap_or(&0);
            let credited = current.checked_add(transfer.amount).ok_or_else(|| {
                Error::ArithmeticOverflow(format!("balance of {}", transfer.to))
            })?;
            balances.insert(to_key, credited);
        }

        Ok((balances, allowances))
    }
}

/// In-memory chain
#[derive(Debug)]
pub struct LocalChain {
    state: Mutex<ChainState>,
    available: AtomicBool,
    response_delay: Mutex<Option<Duration>>,
    hold_submissions: AtomicBool,
    mempool: Mutex<Vec<Transaction>>,
}

impl LocalChain {
    /// New chain with a genesis block at `genesis_timestamp`
    pub fn new(genesis_timestamp: u64) -> Self {
        let genesis = BlockHeader {
            number: 0,
            timestamp: genesis_timestamp,
            hash: block_hash(0, genesis_timestamp, &[0u8; 32], &[]),
            parent_hash: [0u8; 32],
        };

        Self {
            state: Mutex::new(ChainState {
                blocks: vec![genesis],
                logs: Vec::new(),
                balances: HashMap::new(),
                allowances: HashMap::new(),
                receipts: HashMap::new(),
            }),
            available: AtomicBool::new(true),
            response_delay: Mutex::new(None),
            hold_submissions: AtomicBool::new(false),
            mempool: Mutex::new(Vec::new()),
        }
    }

    /// Credit tokens out of thin air
    pub fn mint(&self, token: Address, to: Address, amount: TokenAmount) -> Result<()> {
        let mut state = self.state.lock();
        let balance = state.balances.entry((token, to)).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| Error::ArithmeticOverflow(format!("balance of {}", to)))?;
        Ok(())
    }

    /// Set the allowance `owner` grants to `spender`
    pub fn approve(&self, token: Address, owner: Address, spender: Address, amount: TokenAmount) {
        let mut state = self.state.lock();
        state.allowances.insert((token, owner, spender), amount);
    }

    /// Mine one empty block `secs` after the head
    pub fn advance_time(&self, secs: u64) -> BlockHeader {
        let mut state = self.state.lock();
        let timestamp = state.head().timestamp + secs;
        state.mine(timestamp, &[])
    }

    /// Mine `count` empty blocks at the current time
    pub fn mine_blocks(&self, count: u64) -> BlockHeader {
        let mut state = self.state.lock();
        let timestamp = state.head().timestamp;
        for _ in 0..count {
            state.mine(timestamp, &[]);
        }
        state.head().clone()
    }

    /// Head block number
    pub fn head_number(&self) -> u64 {
        self.state.lock().head().number
    }

    /// Take the chain offline (or back online)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every submission response by `delay` after the transaction commits
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.response_delay.lock() = delay;
    }

    /// Park new submissions in the mempool instead of committing them.
    ///
    /// A held submission never answers; callers see their own timeout and
    /// the transaction lands on the next [`LocalChain::flush_mempool`].
    pub fn set_hold_submissions(&self, hold: bool) {
        self.hold_submissions.store(hold, Ordering::SeqCst);
    }

    /// Commit every held transaction in submission order
    pub fn flush_mempool(&self) -> Result<Vec<Receipt>> {
        let pending = std::mem::take(&mut *self.mempool.lock());
        pending.into_iter().map(|tx| self.commit(tx)).collect()
    }

    /// Append a raw log entry, bypassing validation
    pub fn inject_log(&self, entry: LogEntry) {
        self.state.lock().logs.push(entry);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::SyncUnavailable("local chain offline".to_string()))
        }
    }

    fn commit(&self, tx: Transaction) -> Result<Receipt> {
        let mut state = self.state.lock();

        // Resubmitting a committed transaction returns the original receipt
        if let Some(existing) = state.receipts.get(&tx.tx_id) {
            return Ok(existing.clone());
        }

        let (balances, allowances) = state.simulate(tx.token, tx.spender, &tx.transfers)?;

        let timestamp = state.head().timestamp;
        let header = state.mine(timestamp, &[tx.tx_id]);
        state.balances.extend(balances);
        state.allowances.extend(allowances);

        let log_index = tx.event.as_ref().map(|_| 0u32);
        if let Some(event) = tx.event {
            state.logs.push(LogEntry {
                block_number: header.number,
                log_index: 0,
                block_timestamp: header.timestamp,
                tx_id: tx.tx_id,
                event,
            });
        }

        let receipt = Receipt {
            tx_id: tx.tx_id,
            block_number: header.number,
            block_timestamp: header.timestamp,
            log_index,
            tx_hash: tx_hash(&tx.tx_id, &header.hash),
        };
        state.receipts.insert(tx.tx_id, receipt.clone());

        tracing::debug!(
            tx_id = %receipt.tx_id,
            block_number = receipt.block_number,
            transfers = tx.transfers.len(),
            "Transaction committed"
        );

        Ok(receipt)
    }
}

impl Default for LocalChain {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl LedgerClient for LocalChain {
    async fn submit(&self, tx: Transaction) -> Result<Receipt> {
        self.ensure_available()?;
        if self.hold_submissions.load(Ordering::SeqCst) {
            self.mempool.lock().push(tx);
            return std::future::pending().await;
        }
        let receipt = self.commit(tx)?;

        let delay = *self.response_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(receipt)
    }

    async fn receipt(&self, tx_id: Uuid) -> Result<Option<Receipt>> {
        self.ensure_available()?;
        Ok(self.state.lock().receipts.get(&tx_id).cloned())
    }

    async fn get_logs(&self, range: BlockRange) -> Result<Vec<LogEntry>> {
        self.ensure_available()?;
        let state = self.state.lock();
        Ok(state
            .logs
            .iter()
            .filter(|entry| range.contains(entry.block_number))
            .cloned()
            .collect())
    }

    async fn current_block(&self) -> Result<BlockHeader> {
        self.ensure_available()?;
        Ok(self.state.lock().head().clone())
    }

    async fn balance_of(&self, token: Address, account: Address) -> Result<TokenAmount> {
        self.ensure_available()?;
        Ok(*self
            .state
            .lock()
            .balances
            .get(&(token, account))
            .unwrap_or(&0))
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<TokenAmount> {
        self.ensure_available()?;
        Ok(*self
            .state
            .lock()
            .allowances
            .get(&(token, owner, spender))
            .unwrap_or(&0))
    }

    async fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: TokenAmount,
    ) -> Result<Receipt> {
        self.submit(Transaction {
            tx_id: Uuid::now_v7(),
            token,
            spender: from,
            transfers: vec![Transfer { from, to, amount }],
            event: None,
        })
        .await
    }
}

fn block_hash(number: u64, timestamp: u64, parent: &[u8; 32], tx_ids: &[Uuid]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(number.to_be_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(parent);
    for tx_id in tx_ids {
        hasher.update(tx_id.as_bytes());
    }
    hasher.finalize().into()
}

fn tx_hash(tx_id: &Uuid, block_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tx_id.as_bytes());
    hasher.update(block_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FieldValue;
    use crate::types::RegistryEvent;

    fn token() -> Address {
        Address::from_low_u64(0x70)
    }

    fn registered_event() -> RegistryEvent {
        RegistryEvent::MemberRegistered {
            index: 0,
            commitment: FieldValue::from_u64(1),
            message_limit: 1,
            owner: Address::from_low_u64(1),
        }
    }

    #[tokio::test]
    async fn test_transfer_moves_balance() {
        let chain = LocalChain::new(1_000);
        let alice = Address::from_low_u64(1);
        let bob = Address::from_low_u64(2);
        chain.mint(token(), alice, 50).unwrap();

        let receipt = chain.transfer(token(), alice, bob, 20).await.unwrap();
        assert_eq!(receipt.block_number, 1);
        assert_eq!(receipt.log_index, None);
        assert_eq!(chain.balance_of(token(), alice).await.unwrap(), 30);
        assert_eq!(chain.balance_of(token(), bob).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_failed_submission_is_atomic() {
        let chain = LocalChain::new(0);
        let alice = Address::from_low_u64(1);
        let registry = Address::from_low_u64(9);
        chain.mint(token(), alice, 10).unwrap();
        chain.approve(token(), alice, registry, 100);

        // Second transfer overdraws alice; the first must not stick
        let tx = Transaction {
            tx_id: Uuid::now_v7(),
            token: token(),
            spender: registry,
            transfers: vec![
                Transfer {
                    from: alice,
                    to: registry,
                    amount: 6,
                },
                Transfer {
                    from: alice,
                    to: registry,
                    amount: 6,
                },
            ],
            event: Some(registered_event()),
        };

        let err = chain.submit(tx).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { available: 4, .. }));
        assert_eq!(chain.balance_of(token(), alice).await.unwrap(), 10);
        assert_eq!(chain.allowance(token(), alice, registry).await.unwrap(), 100);
        assert_eq!(chain.head_number(), 0);
        assert!(chain
            .get_logs(BlockRange {
                from_block: 0,
                to_block: 10
            })
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_allowance_required() {
        let chain = LocalChain::new(0);
        let alice = Address::from_low_u64(1);
        let registry = Address::from_low_u64(9);
        chain.mint(token(), alice, 10).unwrap();

        let tx = Transaction {
            tx_id: Uuid::now_v7(),
            token: token(),
            spender: registry,
            transfers: vec![Transfer {
                from: alice,
                to: registry,
                amount: 5,
            }],
            event: None,
        };
        assert!(matches!(
            chain.submit(tx).await,
            Err(Error::InsufficientAllowance { .. })
        ));
    }

    #[tokio::test]
    async fn test_resubmission_returns_original_receipt() {
        let chain = LocalChain::new(0);
        let tx = Transaction {
            tx_id: Uuid::now_v7(),
            token: token(),
            spender: Address::from_low_u64(9),
            transfers: vec![],
            event: Some(registered_event()),
        };

        let first = chain.submit(tx.clone()).await.unwrap();
        let second = chain.submit(tx).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(chain.head_number(), 1);
        assert_eq!(chain.receipt(first.tx_id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_offline_chain() {
        let chain = LocalChain::new(0);
        chain.set_available(false);
        assert!(matches!(
            chain.current_block().await,
            Err(Error::SyncUnavailable(_))
        ));
        chain.set_available(true);
        assert_eq!(chain.current_block().await.unwrap().number, 0);
    }

    #[tokio::test]
    async fn test_clock() {
        let chain = LocalChain::new(100);
        let header = chain.advance_time(50);
        assert_eq!(header.number, 1);
        assert_eq!(header.timestamp, 150);
        let header = chain.mine_blocks(3);
        assert_eq!(header.number, 4);
        assert_eq!(header.timestamp, 150);
    }

    #[test]
    fn test_mint_overflow() {
        let chain = LocalChain::new(0);
        let alice = Address::from_low_u64(1);
        chain.mint(token(), alice, u128::MAX).unwrap();
        assert!(matches!(
            chain.mint(token(), alice, 1),
            Err(Error::ArithmeticOverflow(_))
        ));
    }

    #[tokio::test]
    async fn test_held_submission_lands_on_flush() {
        let chain = LocalChain::new(0);
        chain.set_hold_submissions(true);
        let tx = Transaction {
            tx_id: Uuid::now_v7(),
            token: token(),
            spender: Address::from_low_u64(9),
            transfers: vec![],
            event: Some(registered_event()),
        };

        let waited =
            tokio::time::timeout(Duration::from_millis(20), chain.submit(tx.clone())).await;
        assert!(waited.is_err());
        assert_eq!(chain.receipt(tx.tx_id).await.unwrap(), None);

        chain.set_hold_submissions(false);
        let receipts = chain.flush_mempool().unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(chain.receipt(tx.tx_id).await.unwrap(), Some(receipts[0].clone()));
        assert_eq!(chain.head_number(), 1);
    }
}
