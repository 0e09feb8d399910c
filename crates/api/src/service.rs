//! The external operations, each resolved against the caller's tenant.
//!
//! Every call opens its own transaction on the configured [`Database`].
//! Reads roll back; mutations commit only on success.

use chrono::{NaiveDate, Utc};
use tracing::{info, instrument};

use stockbook_core::{DocumentId, ProductId, WarehouseId};
use stockbook_events::{Action, DocumentPayload, OutboxEventId, OutboxStatus};
use stockbook_infra::outbox::{enqueue_document_event, outbox_status, reprocess};
use stockbook_infra::workflow::validate_document;
use stockbook_infra::{ClosingQuery, Database, ValuationQuery, get_closing_snapshot, get_valuation};
use stockbook_inventory::{ClosingRow, ProductKind, ReferenceType, ValuationSnapshot};

use crate::context::{TenantContext, require_tenant};
use crate::errors::ApiError;

/// Optional filters of a closing report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosingFilter {
    pub product_id: Option<ProductId>,
    pub product_kind: Option<ProductKind>,
    pub batch_number: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StockbookService<D> {
    db: D,
}

impl<D: Database> StockbookService<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    /// Reset the latest unprocessed event of a document to pending.
    #[instrument(skip(self, ctx), fields(%reference_type, %reference_id), err)]
    pub async fn reprocess_outbox(
        &self,
        ctx: Option<TenantContext>,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<OutboxStatus, ApiError> {
        let tenant_id = require_tenant(ctx)?;
        let mut tx = self.db.begin().await?;
        match reprocess(&mut *tx, tenant_id, reference_type, reference_id, Utc::now()).await {
            Ok(status) => {
                tx.commit().await?;
                Ok(status)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err.into())
            }
        }
    }

    pub async fn get_outbox_status(
        &self,
        ctx: Option<TenantContext>,
        reference_type: ReferenceType,
        reference_id: DocumentId,
    ) -> Result<OutboxStatus, ApiError> {
        let tenant_id = require_tenant(ctx)?;
        let mut tx = self.db.begin().await?;
        let status = outbox_status(&mut *tx, tenant_id, reference_type, reference_id).await;
        tx.rollback().await?;
        Ok(status?)
    }

    /// Opening, closing and running detail of one product over `[from, to]`.
    pub async fn get_inventory_valuation(
        &self,
        ctx: Option<TenantContext>,
        from: NaiveDate,
        to: NaiveDate,
        product_id: ProductId,
        product_kind: Option<ProductKind>,
        warehouse_id: Option<WarehouseId>,
    ) -> Result<ValuationSnapshot, ApiError> {
        let tenant_id = require_tenant(ctx)?;
        if from > to {
            return Err(ApiError::InvalidArgument(format!("from date {from} is after to date {to}")));
        }
        let query = ValuationQuery {
            tenant_id,
            from,
            to,
            product_id,
            product_kind,
            warehouse_id,
        };
        let mut tx = self.db.begin().await?;
        let snapshot = get_valuation(&mut *tx, &query).await;
        tx.rollback().await?;
        Ok(snapshot?)
    }

    /// Closing stock per product in one warehouse as of `at`.
    pub async fn get_closing_inventory_valuation(
        &self,
        ctx: Option<TenantContext>,
        at: NaiveDate,
        warehouse_id: WarehouseId,
        filter: ClosingFilter,
    ) -> Result<Vec<ClosingRow>, ApiError> {
        let tenant_id = require_tenant(ctx)?;
        let query = ClosingQuery {
            tenant_id,
            at,
            warehouse_id,
            product_id: filter.product_id,
            product_kind: filter.product_kind,
            batch_number: filter.batch_number,
        };
        let mut tx = self.db.begin().await?;
        let rows = get_closing_snapshot(&mut *tx, &query).await;
        tx.rollback().await?;
        Ok(rows?)
    }

    /// Record a document change for the processor.
    ///
    /// Creates and updates are validated against the catalogue first so bad
    /// documents never reach the outbox.
    #[instrument(skip(self, ctx, document), fields(%reference_type, %reference_id, %action), err)]
    pub async fn submit_document(
        &self,
        ctx: Option<TenantContext>,
        reference_type: ReferenceType,
        reference_id: DocumentId,
        action: Action,
        document: Option<DocumentPayload>,
    ) -> Result<OutboxEventId, ApiError> {
        let tenant_id = require_tenant(ctx)?;
        if action != Action::Delete && document.is_none() {
            return Err(ApiError::InvalidArgument(format!("{action} requires a document payload")));
        }

        let mut tx = self.db.begin().await?;
        let result = async {
            if let Some(doc) = document.as_ref().filter(|_| action != Action::Delete) {
                validate_document(&mut *tx, tenant_id, doc).await?;
            }
            let id = enqueue_document_event(
                &mut *tx,
                tenant_id,
                reference_type,
                reference_id,
                action,
                document.as_ref(),
                Utc::now(),
            )
            .await?;
            Ok::<_, ApiError>(id)
        }
        .await;

        match result {
            Ok(id) => {
                tx.commit().await?;
                info!(event_id = %id, "document event recorded");
                Ok(id)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }
}
