//! Purchase intent correlation
//!
//! Finds the pre-purchase intent a new order most likely came from. Tiers are
//! tried in order and the first hit wins; within a tier the newest open record
//! is taken. Nothing found is a normal outcome.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::PurchaseIntentData;
use crate::store::LeadStore;

#[derive(Debug, Clone)]
pub struct CorrelationQuery {
    pub user_email: Option<String>,
    pub user_id: Uuid,
    pub pricing_plan_id: Uuid,
    pub association_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationTier {
    /// Exact (email, plan, association)
    Email,
    /// Exact (user, plan)
    UserId,
}

#[derive(Debug, Clone)]
pub struct CorrelationMatch {
    pub intent: PurchaseIntentData,
    pub tier: CorrelationTier,
    /// The intent was anonymous and now carries the buyer's user id
    pub adopted: bool,
}

pub struct CorrelationResolver {
    leads: Arc<dyn LeadStore>,
}

impl CorrelationResolver {
    pub fn new(leads: Arc<dyn LeadStore>) -> Self {
        Self { leads }
    }

    pub async fn resolve(
        &self,
        query: &CorrelationQuery,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CorrelationMatch>> {
        if let Some(email) = query.user_email.as_deref().filter(|e| !e.is_empty()) {
            if let Some(intent) = self
                .leads
                .find_intent_by_email(email, query.pricing_plan_id, query.association_id, now)
                .await?
            {
                return Ok(Some(
                    self.adopt_if_anonymous(intent, CorrelationTier::Email, query.user_id)
                        .await,
                ));
            }
        }

        let by_user = self
            .leads
            .find_intent_by_user(query.user_id, query.pricing_plan_id, now)
            .await?;

        Ok(by_user.map(|intent| CorrelationMatch {
            intent,
            tier: CorrelationTier::UserId,
            adopted: false,
        }))
    }

    async fn adopt_if_anonymous(
        &self,
        mut intent: PurchaseIntentData,
        tier: CorrelationTier,
        user_id: Uuid,
    ) -> CorrelationMatch {
        if intent.user_id.is_some() {
            return CorrelationMatch {
                intent,
                tier,
                adopted: false,
            };
        }

        let adopted = match self.leads.adopt_intent(intent.id, user_id).await {
            Ok(adopted) => adopted,
            Err(e) => {
                tracing::warn!(
                    intent_id = %intent.id,
                    user_id = %user_id,
                    error = %e,
                    "Failed to stamp user on anonymous purchase intent"
                );
                false
            }
        };

        if adopted {
            intent.user_id = Some(user_id);
            tracing::debug!(
                intent_id = %intent.id,
                user_id = %user_id,
                "Adopted anonymous purchase intent"
            );
        }

        CorrelationMatch {
            intent,
            tier,
            adopted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IntentStatus;
    use crate::store::MemoryStore;
    use time::macros::datetime;
    use time::Duration;

    fn intent(
        email: &str,
        user_id: Option<Uuid>,
        plan: Uuid,
        association: Uuid,
        created_at: OffsetDateTime,
    ) -> PurchaseIntentData {
        PurchaseIntentData {
            id: Uuid::new_v4(),
            email: email.to_string(),
            user_id,
            association_id: Some(association),
            pricing_plan_id: Some(plan),
            status: IntentStatus::Pending,
            purchase_order_id: None,
            expires_at: Some(created_at + Duration::days(7)),
            converted_at: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_user_tier_used_when_email_has_no_match() {
        let store = Arc::new(MemoryStore::new());
        let now = datetime!(2025-06-01 12:00 UTC);
        let (user, plan, association) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let email = "other@example.com";
        let older = intent(email, Some(user), plan, association, now - Duration::hours(5));
        let newer = intent(email, Some(user), plan, association, now - Duration::hours(1));
        store.insert_intent(older).await;
        store.insert_intent(newer.clone()).await;

        let resolver = CorrelationResolver::new(store.clone());
        let found = resolver
            .resolve(
                &CorrelationQuery {
                    user_email: Some("buyer@example.com".into()),
                    user_id: user,
                    pricing_plan_id: plan,
                    association_id: association,
                },
                now,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.tier, CorrelationTier::UserId);
        assert_eq!(found.intent.id, newer.id);
    }

    #[tokio::test]
    async fn test_email_match_is_case_sensitive_and_adopts_anonymous_intent() {
        let store = Arc::new(MemoryStore::new());
        let now = datetime!(2025-06-01 12:00 UTC);
        let (user, plan, association) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let created = now - Duration::hours(2);
        let anonymous = intent("buyer@example.com", None, plan, association, created);
        store.insert_intent(anonymous.clone()).await;

        let resolver = CorrelationResolver::new(store.clone());
        let mut query = CorrelationQuery {
            user_email: Some("Buyer@Example.com".into()),
            user_id: user,
            pricing_plan_id: plan,
            association_id: association,
        };
        assert!(resolver.resolve(&query, now).await.unwrap().is_none());

        query.user_email = Some("buyer@example.com".into());
        let found = resolver.resolve(&query, now).await.unwrap().unwrap();
        assert_eq!(found.tier, CorrelationTier::Email);
        assert!(found.adopted);
        assert_eq!(store.intent(anonymous.id).await.unwrap().user_id, Some(user));
    }

    #[tokio::test]
    async fn test_expired_and_converted_intents_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let now = datetime!(2025-06-01 12:00 UTC);
        let (user, plan, association) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let created = now - Duration::days(10);
        let mut expired = intent("buyer@example.com", Some(user), plan, association, created);
        expired.expires_at = Some(now - Duration::days(3));
        let mut converted = intent("buyer@example.com", Some(user), plan, association, now);
        converted.status = IntentStatus::Converted;
        store.insert_intent(expired).await;
        store.insert_intent(converted).await;

        let resolver = CorrelationResolver::new(store);
        let found = resolver
            .resolve(
                &CorrelationQuery {
                    user_email: Some("buyer@example.com".into()),
                    user_id: user,
                    pricing_plan_id: plan,
                    association_id: association,
                },
                now,
            )
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
