//! Purchase confirmation email over the Resend HTTP API

use std::time::Duration;

use async_trait::async_trait;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::collaborators::{PurchaseNotifier, PurchaseSummary};
use crate::error::{BillingError, BillingResult};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Sending is disabled when no key is configured
    pub api_key: Option<String>,
    pub from: String,
    pub app_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            from: std::env::var("EMAIL_FROM").unwrap_or(defaults.from),
            app_url: std::env::var("APP_URL").unwrap_or(defaults.app_url),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            from: "Membra <billing@membra.app>".to_string(),
            app_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct BillingEmailService {
    http: reqwest::Client,
    config: EmailConfig,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, config }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn send(&self, to: &str, subject: &str, html: String) -> BillingResult<()> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::info!(
                to = %to,
                subject = %subject,
                "Email disabled (RESEND_API_KEY not set), skipping"
            );
            return Ok(());
        };

        let response = self
            .http
            .post(RESEND_ENDPOINT)
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "from": self.config.from,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Notification(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Notification(format!(
                "Resend returned {}: {}",
                status, body
            )));
        }

        tracing::info!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }
}

#[async_trait]
impl PurchaseNotifier for BillingEmailService {
    async fn send_purchase_confirmation(
        &self,
        email: &str,
        summary: &PurchaseSummary,
    ) -> BillingResult<()> {
        let subject = format!("Your {} membership is active", summary.association_name);
        let html = render_purchase_confirmation(summary, &self.config.app_url);
        self.send(email, &subject, html).await
    }
}

fn format_date(value: OffsetDateTime) -> String {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| value.date().to_string())
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn render_purchase_confirmation(summary: &PurchaseSummary, app_url: &str) -> String {
    let greeting = match summary.recipient_name.as_deref() {
        Some(name) if !name.is_empty() => format!("Hi {},", escape_html(name)),
        _ => "Hi,".to_string(),
    };

    format!(
        r#"<p>{greeting}</p>
<p>Thank you for your payment. Your membership of <strong>{association}</strong> is now active.</p>
<table>
  <tr><td>Order</td><td>{order_number}</td></tr>
  <tr><td>Amount</td><td>{amount}</td></tr>
  <tr><td>Valid from</td><td>{start}</td></tr>
  <tr><td>Valid until</td><td>{end}</td></tr>
</table>
<p><a href="{app_url}/memberships">View your memberships</a></p>"#,
        greeting = greeting,
        association = escape_html(&summary.association_name),
        order_number = escape_html(&summary.order_number),
        amount = escape_html(&summary.amount_display),
        start = format_date(summary.membership_start),
        end = format_date(summary.membership_end),
        app_url = app_url.trim_end_matches('/'),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn summary() -> PurchaseSummary {
        PurchaseSummary {
            order_number: "ORD-20250601-ABCDEF0123".into(),
            association_name: "Harbour <Rowing> Club".into(),
            recipient_name: Some("Sam".into()),
            amount_display: "HKD 100.00".into(),
            membership_start: datetime!(2025-06-01 09:30 UTC),
            membership_end: datetime!(2026-06-01 09:30 UTC),
        }
    }

    #[test]
    fn test_confirmation_lists_order_details() {
        let html = render_purchase_confirmation(&summary(), "https://app.example.org/");
        assert!(html.contains("Hi Sam,"));
        assert!(html.contains("ORD-20250601-ABCDEF0123"));
        assert!(html.contains("HKD 100.00"));
        assert!(html.contains("2026-06-01"));
        assert!(html.contains("Harbour &lt;Rowing&gt; Club"));
        assert!(html.contains("https://app.example.org/memberships"));
    }

    #[tokio::test]
    async fn test_disabled_service_skips_sending() {
        let service = BillingEmailService::new(EmailConfig::default());
        assert!(!service.is_enabled());
        service
            .send_purchase_confirmation("member@example.com", &summary())
            .await
            .unwrap();
    }
}
