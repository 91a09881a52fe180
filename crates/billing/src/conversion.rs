//! Lead and purchase-intent conversion after a paid order
//!
//! The two lead structures are checked independently and both checks always
//! run; either, both or neither may convert.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{PurchaseOrder, LEAD_SOURCE_PURCHASE_INTENT};
use crate::store::LeadStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionReport {
    pub intent_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
}

pub struct LeadConversion {
    leads: Arc<dyn LeadStore>,
}

impl LeadConversion {
    pub fn new(leads: Arc<dyn LeadStore>) -> Self {
        Self { leads }
    }

    /// Run both conversions. An error in one does not stop the other; the
    /// first error is returned after both have been attempted.
    pub async fn convert_for_order(
        &self,
        order: &PurchaseOrder,
        now: OffsetDateTime,
    ) -> BillingResult<ConversionReport> {
        let intent = self.convert_intent(order, now).await;
        let lead = self.convert_lead(order, now).await;

        if let Err(e) = &intent {
            tracing::warn!(order_id = %order.id, error = %e, "Purchase intent conversion failed");
        }
        if let Err(e) = &lead {
            tracing::warn!(order_id = %order.id, error = %e, "Lead conversion failed");
        }

        let report = ConversionReport {
            intent_id: intent?,
            lead_id: lead?,
        };

        tracing::info!(
            order_id = %order.id,
            intent_id = ?report.intent_id,
            lead_id = ?report.lead_id,
            "Lead conversion finished"
        );

        Ok(report)
    }

    async fn convert_intent(
        &self,
        order: &PurchaseOrder,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Uuid>> {
        // Intent linked at order creation first, then the newest open one
        let candidate = match self.leads.find_intent_for_order(order.id).await? {
            Some(linked) => Some(linked),
            None => {
                self.leads
                    .find_open_intent_for_member(order.user_id, order.association_id, now)
                    .await?
            }
        };

        let Some(intent) = candidate else {
            return Ok(None);
        };

        let converted = self
            .leads
            .mark_intent_converted(intent.id, order.id, now)
            .await?;
        Ok(converted.then_some(intent.id))
    }

    async fn convert_lead(
        &self,
        order: &PurchaseOrder,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Uuid>> {
        let candidate = match self.leads.find_lead_by_order(order.id).await? {
            Some(linked) if !linked.status.is_terminal() => Some(linked),
            Some(_) => return Ok(None),
            None => {
                self.leads
                    .find_open_lead(
                        order.user_id,
                        order.association_id,
                        LEAD_SOURCE_PURCHASE_INTENT,
                    )
                    .await?
            }
        };

        let Some(lead) = candidate else {
            return Ok(None);
        };

        let converted = self.leads.mark_lead_converted(lead.id, order.id, now).await?;
        Ok(converted.then_some(lead.id))
    }
}
