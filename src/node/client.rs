//! LDK Server client
//!
//! Implements [`PaymentNetworkClient`] over ldk-server's API. Outbound
//! payment status is polled with `get_payment_details`; invoice settlement
//! arrives through the [`InvoiceEventHub`] fed by the RabbitMQ consumer.

use super::{
    CreatedInvoice, DecodedPaymentRequest, InvoiceEvent, InvoiceEventHub, InvoiceState, PaymentNetworkClient,
    PaymentStatus, PaymentUpdate, SendPaymentRequest,
};
use crate::{config::LdkServerConfig, LedgerError, LedgerResult};
use async_trait::async_trait;
use ldk_server_protos::api::{Bolt11ReceiveRequest, Bolt11SendRequest, GetPaymentDetailsRequest};
use ldk_server_protos::types::{bolt11_invoice_description::Kind, Bolt11InvoiceDescription, Payment};
use lightning_invoice::Bolt11Invoice;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

fn map_client_error(e: ldk_server_client::error::LdkServerError) -> LedgerError {
    LedgerError::Node(format!("LdkServer error: {:?}", e))
}

fn parse_invoice(payment_request: &str) -> LedgerResult<Bolt11Invoice> {
    Bolt11Invoice::from_str(payment_request.trim())
        .map_err(|_| LedgerError::Validation("invalid payment request format".to_string()))
}

fn payment_status(payment: &Payment) -> PaymentStatus {
    use ldk_server_protos::types::PaymentStatus as Proto;
    match Proto::from_i32(payment.status) {
        Some(Proto::Succeeded) => PaymentStatus::Succeeded,
        Some(Proto::Failed) => PaymentStatus::Failed,
        _ => PaymentStatus::InFlight,
    }
}

/// Payment network client backed by LDK Server
pub struct LdkServerClient {
    client: Arc<ldk_server_client::client::LdkServerClient>,
    hub: InvoiceEventHub,
    poll_interval: Duration,
    unknown_grace: Duration,
}

impl LdkServerClient {
    /// Connect to ldk-server
    pub async fn connect(config: &LdkServerConfig, hub: InvoiceEventHub) -> LedgerResult<Self> {
        let base_url = config.address();

        info!("Connecting to LDK Server at {}", base_url);

        let cert_pem = if let Some(cert_path) = &config.tls_certificate {
            debug!("Using TLS certificate: {:?}", cert_path);
            tokio::fs::read(cert_path)
                .await
                .map_err(|e| LedgerError::Node(format!("Failed to read TLS certificate: {}", e)))?
        } else {
            vec![]
        };

        let api_key = if let Some(api_key_path) = &config.api_key_file {
            debug!("Reading API key from file: {:?}", api_key_path);
            let bytes = tokio::fs::read(api_key_path)
                .await
                .map_err(|e| LedgerError::Node(format!("Failed to read API key file: {}", e)))?;
            // binary key files are hex encoded
            String::from_utf8(bytes.clone())
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| hex::encode(&bytes))
        } else {
            config.auth_token.clone().unwrap_or_default()
        };

        let client = ldk_server_client::client::LdkServerClient::new(base_url, api_key, &cert_pem)
            .map_err(|e| LedgerError::Node(format!("Failed to create LDK Server client: {}", e)))?;

        info!("Successfully connected to LDK Server");

        Ok(Self {
            client: Arc::new(client),
            hub,
            poll_interval: Duration::from_millis(config.payment_poll_ms),
            unknown_grace: Duration::from_secs(config.unknown_payment_grace_seconds),
        })
    }

    async fn get_payment(
        client: &ldk_server_client::client::LdkServerClient,
        payment_hash: &str,
    ) -> LedgerResult<Option<Payment>> {
        let request = GetPaymentDetailsRequest {
            payment_id: payment_hash.to_string(),
        };
        let response = client.get_payment_details(request).await.map_err(map_client_error)?;
        Ok(response.payment)
    }

    /// Poll a payment until it resolves, forwarding each status change
    ///
    /// A payment LDK Server still has no record of once `unknown_grace` has
    /// passed is reported as [`PaymentStatus::Unknown`].
    fn spawn_status_poller(&self, payment_hash: String, updates: mpsc::Sender<PaymentUpdate>) {
        let client = self.client.clone();
        let poll_interval = self.poll_interval;
        let unknown_grace = self.unknown_grace;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut last_status = None;
            loop {
                if updates.is_closed() {
                    break;
                }
                match Self::get_payment(&client, &payment_hash).await {
                    Ok(Some(payment)) => {
                        let status = payment_status(&payment);
                        if last_status != Some(status) {
                            last_status = Some(status);
                            let update = PaymentUpdate {
                                payment_hash: payment_hash.clone(),
                                status,
                                fee_paid_msat: payment.fee_paid_msat.unwrap_or(0),
                                failure_reason: (status == PaymentStatus::Failed)
                                    .then(|| "payment failed".to_string()),
                            };
                            let terminal = update.is_terminal();
                            if updates.send(update).await.is_err() || terminal {
                                break;
                            }
                        }
                    }
                    Ok(None) if last_status.is_none() && started.elapsed() >= unknown_grace => {
                        warn!(
                            "Payment {} still unknown to LDK Server after {:?}",
                            payment_hash, unknown_grace
                        );
                        let update = PaymentUpdate {
                            payment_hash: payment_hash.clone(),
                            status: PaymentStatus::Unknown,
                            fee_paid_msat: 0,
                            failure_reason: Some("payment unknown to the node".to_string()),
                        };
                        let _ = updates.send(update).await;
                        break;
                    }
                    Ok(None) => debug!("Payment {} not known to LDK Server yet", payment_hash),
                    Err(e) => warn!("Failed to poll payment {}: {}", payment_hash, e),
                }
                tokio::time::sleep(poll_interval).await;
            }
            debug!("Stopped polling payment {}", payment_hash);
        });
    }
}

#[async_trait]
impl PaymentNetworkClient for LdkServerClient {
    async fn create_invoice(&self, memo: &str, amount_msat: u64, expiry_secs: u32) -> LedgerResult<CreatedInvoice> {
        debug!(
            "Creating invoice (amount: {} msat, description: {}, expiry: {})",
            amount_msat, memo, expiry_secs
        );

        let description = (!memo.is_empty()).then(|| Bolt11InvoiceDescription {
            kind: Some(Kind::Direct(memo.to_string())),
        });

        let request = Bolt11ReceiveRequest {
            amount_msat: (amount_msat > 0).then_some(amount_msat),
            description,
            expiry_secs,
        };

        let response = self.client.bolt11_receive(request).await.map_err(|e| {
            error!("Failed to create invoice via ldk-server: {:?}", e);
            map_client_error(e)
        })?;

        let invoice = parse_invoice(&response.invoice)
            .map_err(|_| LedgerError::Node("LDK Server returned an unparsable invoice".to_string()))?;

        Ok(CreatedInvoice {
            payment_hash: invoice.payment_hash().to_string(),
            pubkey: invoice.recover_payee_pub_key().to_string(),
            payment_request: response.invoice,
        })
    }

    async fn decode_payment_request(&self, payment_request: &str) -> LedgerResult<DecodedPaymentRequest> {
        let invoice = parse_invoice(payment_request)?;

        Ok(DecodedPaymentRequest {
            payment_hash: invoice.payment_hash().to_string(),
            amount_msat: invoice.amount_milli_satoshis().unwrap_or(0),
            destination: invoice
                .payee_pub_key()
                .copied()
                .unwrap_or_else(|| invoice.recover_payee_pub_key())
                .to_string(),
        })
    }

    async fn send_payment(&self, request: SendPaymentRequest) -> LedgerResult<mpsc::Receiver<PaymentUpdate>> {
        let invoice = parse_invoice(&request.payment_request)?;
        let payment_hash = invoice.payment_hash().to_string();

        info!(
            "Paying invoice {} (amount: {} msat, fee limit: {} msat)",
            payment_hash, request.amount_msat, request.fee_limit_msat
        );

        let send = Bolt11SendRequest {
            invoice: request.payment_request.clone(),
            amount_msat: invoice
                .amount_milli_satoshis()
                .is_none()
                .then_some(request.amount_msat),
            ..Default::default()
        };

        let response = tokio::time::timeout(request.timeout, self.client.bolt11_send(send))
            .await
            .map_err(|_| LedgerError::Node("timed out waiting for LDK Server to accept the payment".to_string()))?
            .map_err(map_client_error)?;

        info!("Payment initiated: payment_id={}", response.payment_id);

        let (tx, rx) = mpsc::channel(16);
        let ack = PaymentUpdate {
            payment_hash: payment_hash.clone(),
            status: PaymentStatus::InFlight,
            fee_paid_msat: 0,
            failure_reason: None,
        };
        tx.send(ack)
            .await
            .map_err(|_| LedgerError::Node("payment update channel closed".to_string()))?;
        self.spawn_status_poller(response.payment_id, tx);

        Ok(rx)
    }

    async fn track_payment(&self, payment_hash: &str) -> LedgerResult<mpsc::Receiver<PaymentUpdate>> {
        let (tx, rx) = mpsc::channel(16);
        self.spawn_status_poller(payment_hash.to_string(), tx);
        Ok(rx)
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> LedgerResult<InvoiceEvent> {
        let payment = Self::get_payment(&self.client, payment_hash).await?;

        let (state, amount_paid_msat) = match payment {
            Some(payment) => match payment_status(&payment) {
                PaymentStatus::Succeeded => (InvoiceState::Settled, payment.amount_msat.unwrap_or(0)),
                PaymentStatus::Failed => (InvoiceState::Canceled, 0),
                PaymentStatus::InFlight | PaymentStatus::Unknown => (InvoiceState::Open, 0),
            },
            None => (InvoiceState::Open, 0),
        };

        Ok(InvoiceEvent {
            payment_hash: payment_hash.to_string(),
            state,
            amount_paid_msat,
        })
    }

    async fn subscribe_invoice_events(&self) -> LedgerResult<broadcast::Receiver<InvoiceEvent>> {
        Ok(self.hub.subscribe())
    }
}
