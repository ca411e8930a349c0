//! In-memory payment network for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ldk_ledger::{
    config::Config,
    db::{WalletOptions, WalletRef},
    node::{
        CreatedInvoice, DecodedPaymentRequest, InvoiceEvent, InvoiceEventHub, InvoiceState, PaymentNetworkClient,
        PaymentStatus, PaymentUpdate, SendPaymentRequest,
    },
    LedgerApp, LedgerError, LedgerResult,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const NODE_PUBKEY: &str = "02aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const REMOTE_PUBKEY: &str = "03bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

/// What the node does with the next outbound payments
#[derive(Debug, Clone)]
pub enum PaymentScript {
    /// Accept and succeed with this fee
    Succeed { fee_msat: u64 },
    /// Accept and fail
    Fail(String),
    /// Accept and stay in flight until resolved
    Hold,
    /// Refuse to dispatch
    Reject,
}

#[derive(Default)]
struct State {
    requests: HashMap<String, DecodedPaymentRequest>,
    invoices: HashMap<String, InvoiceEvent>,
    /// Terminal updates of resolved payments, replayed to trackers
    resolved: HashMap<String, PaymentUpdate>,
    /// Status streams of payments still in flight
    held: HashMap<String, Vec<mpsc::Sender<PaymentUpdate>>>,
    /// Hashes of every payment the node accepted
    dispatched: HashSet<String>,
    sent: Vec<SendPaymentRequest>,
    track_calls: u64,
}

/// A node whose payment behavior is scripted by the test
pub struct FakeNode {
    hub: InvoiceEventHub,
    next_id: AtomicU64,
    script: Mutex<PaymentScript>,
    state: Mutex<State>,
}

impl FakeNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hub: InvoiceEventHub::new(),
            next_id: AtomicU64::new(1),
            script: Mutex::new(PaymentScript::Succeed { fee_msat: 0 }),
            state: Mutex::new(State::default()),
        })
    }

    pub fn script(&self, script: PaymentScript) {
        *self.script.lock().unwrap() = script;
    }

    fn next_hash(&self) -> String {
        format!("{:064x}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// A payment request issued by some other node
    pub fn remote_invoice(&self, amount_msat: u64) -> (String, String) {
        let payment_hash = self.next_hash();
        let payment_request = format!("lnbcrt{}remote{}", amount_msat, payment_hash);
        self.state.lock().unwrap().requests.insert(
            payment_request.clone(),
            DecodedPaymentRequest {
                payment_hash: payment_hash.clone(),
                amount_msat,
                destination: REMOTE_PUBKEY.to_string(),
            },
        );
        (payment_request, payment_hash)
    }

    /// Mark an invoice paid and announce it
    pub fn settle_invoice(&self, payment_hash: &str, amount_paid_msat: u64) {
        let event = self.record_invoice(payment_hash, InvoiceState::Settled, amount_paid_msat);
        self.hub.publish(event);
    }

    /// Mark an invoice paid without announcing it, as if the event was missed
    pub fn settle_invoice_silently(&self, payment_hash: &str, amount_paid_msat: u64) {
        self.record_invoice(payment_hash, InvoiceState::Settled, amount_paid_msat);
    }

    /// Mark an invoice canceled and announce it
    pub fn cancel_invoice(&self, payment_hash: &str) {
        let event = self.record_invoice(payment_hash, InvoiceState::Canceled, 0);
        self.hub.publish(event);
    }

    fn record_invoice(&self, payment_hash: &str, state: InvoiceState, amount_paid_msat: u64) -> InvoiceEvent {
        let event = InvoiceEvent {
            payment_hash: payment_hash.to_string(),
            state,
            amount_paid_msat,
        };
        self.state
            .lock()
            .unwrap()
            .invoices
            .insert(payment_hash.to_string(), event.clone());
        event
    }

    /// Resolve a held payment
    pub fn resolve_payment(&self, payment_hash: &str, success: bool, fee_msat: u64) {
        let update = terminal_update(payment_hash, success, fee_msat);
        let mut state = self.state.lock().unwrap();
        for sender in state.held.remove(payment_hash).unwrap_or_default() {
            let _ = sender.try_send(update.clone());
        }
        state.resolved.insert(payment_hash.to_string(), update);
    }

    /// Resolve a payment the node dispatched before a restart
    pub fn resolve_offline(&self, payment_hash: &str, success: bool, fee_msat: u64) {
        self.state
            .lock()
            .unwrap()
            .resolved
            .insert(payment_hash.to_string(), terminal_update(payment_hash, success, fee_msat));
    }

    pub fn sent(&self) -> Vec<SendPaymentRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn track_calls(&self) -> u64 {
        self.state.lock().unwrap().track_calls
    }
}

fn terminal_update(payment_hash: &str, success: bool, fee_msat: u64) -> PaymentUpdate {
    PaymentUpdate {
        payment_hash: payment_hash.to_string(),
        status: if success {
            PaymentStatus::Succeeded
        } else {
            PaymentStatus::Failed
        },
        fee_paid_msat: if success { fee_msat } else { 0 },
        failure_reason: (!success).then(|| "no route".to_string()),
    }
}

fn in_flight(payment_hash: &str) -> PaymentUpdate {
    PaymentUpdate {
        payment_hash: payment_hash.to_string(),
        status: PaymentStatus::InFlight,
        fee_paid_msat: 0,
        failure_reason: None,
    }
}

#[async_trait]
impl PaymentNetworkClient for FakeNode {
    async fn create_invoice(&self, _memo: &str, amount_msat: u64, _expiry_secs: u32) -> LedgerResult<CreatedInvoice> {
        let payment_hash = self.next_hash();
        let payment_request = format!("lnbcrt{}local{}", amount_msat, payment_hash);

        let mut state = self.state.lock().unwrap();
        state.requests.insert(
            payment_request.clone(),
            DecodedPaymentRequest {
                payment_hash: payment_hash.clone(),
                amount_msat,
                destination: NODE_PUBKEY.to_string(),
            },
        );
        state.invoices.insert(
            payment_hash.clone(),
            InvoiceEvent {
                payment_hash: payment_hash.clone(),
                state: InvoiceState::Open,
                amount_paid_msat: 0,
            },
        );

        Ok(CreatedInvoice {
            payment_request,
            payment_hash,
            pubkey: NODE_PUBKEY.to_string(),
        })
    }

    async fn decode_payment_request(&self, payment_request: &str) -> LedgerResult<DecodedPaymentRequest> {
        self.state
            .lock()
            .unwrap()
            .requests
            .get(payment_request)
            .cloned()
            .ok_or_else(|| LedgerError::Node("unparsable payment request".to_string()))
    }

    async fn send_payment(&self, request: SendPaymentRequest) -> LedgerResult<mpsc::Receiver<PaymentUpdate>> {
        let script = self.script.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        state.sent.push(request.clone());
        if let PaymentScript::Reject = script {
            return Err(LedgerError::Node("payment rejected".to_string()));
        }

        let payment_hash = state
            .requests
            .get(&request.payment_request)
            .map(|decoded| decoded.payment_hash.clone())
            .ok_or_else(|| LedgerError::Node("unparsable payment request".to_string()))?;

        state.dispatched.insert(payment_hash.clone());
        let (tx, rx) = mpsc::channel(8);
        let _ = tx.try_send(in_flight(&payment_hash));
        match script {
            PaymentScript::Succeed { fee_msat } => {
                let update = terminal_update(&payment_hash, true, fee_msat);
                let _ = tx.try_send(update.clone());
                state.resolved.insert(payment_hash, update);
            }
            PaymentScript::Fail(reason) => {
                let mut update = terminal_update(&payment_hash, false, 0);
                update.failure_reason = Some(reason);
                let _ = tx.try_send(update.clone());
                state.resolved.insert(payment_hash, update);
            }
            PaymentScript::Hold => state.held.entry(payment_hash).or_default().push(tx),
            PaymentScript::Reject => {}
        }
        Ok(rx)
    }

    async fn track_payment(&self, payment_hash: &str) -> LedgerResult<mpsc::Receiver<PaymentUpdate>> {
        let mut state = self.state.lock().unwrap();
        state.track_calls += 1;

        let (tx, rx) = mpsc::channel(8);
        if let Some(update) = state.resolved.get(payment_hash) {
            let _ = tx.try_send(in_flight(payment_hash));
            let _ = tx.try_send(update.clone());
        } else if state.dispatched.contains(payment_hash) {
            let _ = tx.try_send(in_flight(payment_hash));
            state.held.entry(payment_hash.to_string()).or_default().push(tx);
        } else {
            let _ = tx.try_send(PaymentUpdate {
                payment_hash: payment_hash.to_string(),
                status: PaymentStatus::Unknown,
                fee_paid_msat: 0,
                failure_reason: Some("payment unknown to the node".to_string()),
            });
        }
        Ok(rx)
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> LedgerResult<InvoiceEvent> {
        self.state
            .lock()
            .unwrap()
            .invoices
            .get(payment_hash)
            .cloned()
            .ok_or(LedgerError::InvoiceNotFound)
    }

    async fn subscribe_invoice_events(&self) -> LedgerResult<broadcast::Receiver<InvoiceEvent>> {
        Ok(self.hub.subscribe())
    }
}

pub fn test_config(db_path: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.ledger.admin_api_key = "admin-key".to_string();
    config.ledger.recovery_pacing_ms = 0;
    config.database.url = format!("sqlite:{}", db_path.display());
    config.lnurl.hostname = "ledger.example.com".to_string();
    config
}

/// A started ledger on a fresh database
pub struct TestLedger {
    pub app: LedgerApp,
    pub node: Arc<FakeNode>,
    pub dir: tempfile::TempDir,
}

impl TestLedger {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let node = FakeNode::new();
        let app = Self::open(&dir, node.clone()).await;
        Self { app, node, dir }
    }

    /// Open another ledger instance on the same database and node
    pub async fn restart(&self) -> LedgerApp {
        self.app.shutdown().await.unwrap();
        Self::open(&self.dir, self.node.clone()).await
    }

    async fn open(dir: &tempfile::TempDir, node: Arc<FakeNode>) -> LedgerApp {
        let config = test_config(&dir.path().join("ledger.db"));
        let app = LedgerApp::with_node(config, node).await.unwrap();
        app.start().await.unwrap();
        app
    }
}

const POLLS: usize = 200;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wait for a wallet balance, failing the test after two seconds
pub async fn wait_for_balance(app: &LedgerApp, wallet: &WalletRef, expected_msat: u64) {
    let mut balance = 0;
    for _ in 0..POLLS {
        balance = app.wallets.get_wallet(wallet).await.unwrap().balance_msat;
        if balance == expected_msat {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("balance of {} stayed at {} msat, expected {}", wallet, balance, expected_msat);
}

/// Wait until a wallet has no pending invoices or payments
pub async fn wait_for_no_pending(app: &LedgerApp, wallet: &WalletRef) {
    for _ in 0..POLLS {
        let invoices = app.payments.list_pending_invoices(wallet).await.unwrap();
        let payments = app.payments.list_pending_payments(wallet).await.unwrap();
        if invoices.is_empty() && payments.is_empty() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("{} still has pending records", wallet);
}

/// Wait for a withdraw template's use counter
pub async fn wait_for_withdraw_uses(app: &LedgerApp, k1: &str, expected: u64) {
    for _ in 0..POLLS {
        let request = app.withdraws.get_withdraw_request(k1).await.unwrap();
        if request.withdraw.uses == expected {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("withdraw {} never reached {} uses", k1, expected);
}

/// Give a wallet funds without going through the node
pub async fn fund(app: &LedgerApp, wallet: &WalletRef, balance_msat: u64) {
    let options = WalletOptions {
        balance_msat: Some(balance_msat),
        ..Default::default()
    };
    app.wallets.admin_update_wallet_options(wallet, &options).await.unwrap();
}
