//! End-to-end tests for the outbox-to-ledger pipeline.
//!
//! Tests: enqueue → lease → workflow → rebuild → valuation / postings
//!
//! Verifies:
//! - A backdated adjustment reprices later invoices and their postings
//! - Concurrent leases never hand out the same event twice
//! - Dead events come back through reprocess

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use stockbook_core::{DocumentId, DocumentLineId};
    use stockbook_events::{Action, DocumentLine, DocumentPayload, OutboxState, RetryPolicy};
    use stockbook_inventory::{OpeningSource, PostingAccount, ProductKind, ReferenceType};

    use crate::outbox::{
        ControlError, OutboxProcessor, OutboxProcessorConfig, enqueue_document_event, outbox_status, reprocess,
    };
    use crate::store::{Database, InMemoryDatabase};
    use crate::test_support::{Fixture, date};
    use crate::valuation::{ValuationQuery, get_valuation};
    use crate::workflow::WorkflowRegistry;

    fn document(fx: &Fixture, on: chrono::NaiveDate, quantity: Decimal, unit_cost: Decimal) -> DocumentPayload {
        DocumentPayload {
            transaction_date: on,
            lines: vec![DocumentLine {
                line_id: DocumentLineId::new(),
                product_id: fx.product_id,
                product_kind: ProductKind::Single,
                warehouse_id: fx.warehouse_id,
                batch_number: None,
                quantity,
                unit_cost,
                is_transfer_in: false,
                description: String::new(),
            }],
        }
    }

    async fn submit(
        db: &InMemoryDatabase,
        fx: &Fixture,
        reference_type: ReferenceType,
        action: Action,
        doc: Option<&DocumentPayload>,
        now: DateTime<Utc>,
    ) -> DocumentId {
        let id = DocumentId::new();
        let mut tx = db.begin().await.unwrap();
        enqueue_document_event(&mut *tx, fx.tenant_id, reference_type, id, action, doc, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    fn processor(db: &InMemoryDatabase) -> OutboxProcessor<InMemoryDatabase> {
        OutboxProcessor::new(
            db.clone(),
            WorkflowRegistry::with_stock_movements(),
            OutboxProcessorConfig::default(),
        )
    }

    #[tokio::test]
    async fn backdated_adjustment_corrects_invoice_cost() {
        let fx = Fixture::new();
        let db = fx.seeded_database().await;
        let now = Utc::now();
        let processor = processor(&db);

        let opening = document(&fx, date(12, 31), dec!(1), dec!(1700));
        submit(&db, &fx, ReferenceType::OpeningStock, Action::Create, Some(&opening), now).await;
        let bill = document(&fx, date(1, 3), dec!(2), dec!(1800));
        submit(&db, &fx, ReferenceType::Bill, Action::Create, Some(&bill), now).await;
        let sale = document(&fx, date(1, 8), dec!(-2), dec!(0));
        let invoice = submit(&db, &fx, ReferenceType::Invoice, Action::Create, Some(&sale), now).await;
        assert_eq!(processor.run_once(now).await.unwrap().succeeded, 3);

        let mut tx = db.begin().await.unwrap();
        let blended = tx.cost_posting(fx.tenant_id, ReferenceType::Invoice, invoice).await.unwrap().unwrap();
        assert_eq!(blended.cost_of_goods, dec!(3500));
        drop(tx);

        let adjustment = document(&fx, date(1, 5), dec!(-1), dec!(1700));
        submit(&db, &fx, ReferenceType::InventoryAdjustment, Action::Create, Some(&adjustment), now).await;
        assert_eq!(processor.run_once(now).await.unwrap().succeeded, 1);

        let mut tx = db.begin().await.unwrap();
        let rows = tx.entries_for_reference(fx.tenant_id, ReferenceType::Invoice, invoice).await.unwrap();
        assert_eq!(rows[0].base_unit_cost, dec!(1800));
        assert_eq!(rows[0].quantity.abs() * rows[0].base_unit_cost, dec!(3600));

        let posting = tx.cost_posting(fx.tenant_id, ReferenceType::Invoice, invoice).await.unwrap().unwrap();
        assert_eq!(posting.cost_of_goods, dec!(3600));
        for line in &posting.lines {
            match line.account {
                PostingAccount::CostOfGoodsSold => assert_eq!(line.debit, dec!(3600)),
                PostingAccount::Inventory => assert_eq!(line.credit, dec!(3600)),
            }
        }

        let snapshot = get_valuation(
            &mut *tx,
            &ValuationQuery {
                tenant_id: fx.tenant_id,
                from: date(12, 31),
                to: date(1, 31),
                product_id: fx.product_id,
                product_kind: Some(ProductKind::Single),
                warehouse_id: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(snapshot.opening_source, OpeningSource::OpeningPostings);
        assert_eq!(snapshot.closing.quantity, Decimal::ZERO);
        assert_eq!(snapshot.closing.value, Decimal::ZERO);
        let sequences: Vec<i64> = snapshot.details.iter().map(|d| d.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn concurrent_leases_are_exclusive() {
        let fx = Fixture::new();
        let db = Arc::new(InMemoryDatabase::new());
        let now = Utc::now();
        for _ in 0..40 {
            submit(&db, &fx, ReferenceType::Bill, Action::Delete, None, now).await;
        }

        let mut workers = Vec::new();
        for w in 0..4 {
            let db = db.clone();
            workers.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    let mut tx = db.begin().await.unwrap();
                    let batch = tx
                        .lease(&format!("w{w}"), 3, now, chrono::Duration::minutes(5))
                        .await
                        .unwrap();
                    tx.commit().await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch.into_iter().map(|e| e.id));
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for worker in workers {
            for id in worker.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "event {id} leased twice");
            }
        }
        assert_eq!(total, 40);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let fx = Fixture::new();
        let db = InMemoryDatabase::new();
        let now = Utc::now();
        submit(&db, &fx, ReferenceType::Bill, Action::Delete, None, now).await;

        let timeout = chrono::Duration::seconds(60);
        let mut tx = db.begin().await.unwrap();
        assert_eq!(tx.lease("stalled", 10, now, timeout).await.unwrap().len(), 1);
        assert!(tx.lease("other", 10, now, timeout).await.unwrap().is_empty());
        let reclaimed = tx
            .lease("other", 10, now + chrono::Duration::seconds(61), timeout)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].processing.attempts, 2);
    }

    #[tokio::test]
    async fn dead_event_recovers_through_reprocess() {
        let fx = Fixture::new();
        let db = InMemoryDatabase::new();
        let now = Utc::now();
        let bill = document(&fx, date(1, 3), dec!(2), dec!(10));
        let id = submit(&db, &fx, ReferenceType::Bill, Action::Create, Some(&bill), now).await;

        let processor = OutboxProcessor::new(
            db.clone(),
            WorkflowRegistry::with_stock_movements(),
            OutboxProcessorConfig::default().with_retry_policy(RetryPolicy::fixed(1, Duration::from_secs(1))),
        );
        assert_eq!(processor.run_once(now).await.unwrap().dead, 1);

        let mut tx = db.begin().await.unwrap();
        let status = outbox_status(&mut *tx, fx.tenant_id, ReferenceType::Bill, id).await.unwrap();
        assert_eq!(status.state, OutboxState::Dead);
        assert!(status.last_error.unwrap().contains("does not exist"));
        drop(tx);

        // Operator fixes the catalogue, then reprocesses.
        db.insert_product(fx.product()).await;
        db.insert_warehouse(fx.tenant_id, fx.warehouse_id).await;
        let mut tx = db.begin().await.unwrap();
        let status = reprocess(&mut *tx, fx.tenant_id, ReferenceType::Bill, id, now).await.unwrap();
        assert_eq!(status.state, OutboxState::Pending);
        tx.commit().await.unwrap();

        assert_eq!(processor.run_once(now).await.unwrap().succeeded, 1);
        let mut tx = db.begin().await.unwrap();
        let status = outbox_status(&mut *tx, fx.tenant_id, ReferenceType::Bill, id).await.unwrap();
        assert_eq!(status.state, OutboxState::Succeeded);
        assert!(status.is_processed);

        let again = reprocess(&mut *tx, fx.tenant_id, ReferenceType::Bill, id, now).await.unwrap_err();
        assert!(matches!(again, ControlError::NotFound { .. }));
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_other() {
        let a = Fixture::new();
        let b = Fixture::new();
        let db = a.seeded_database().await;
        let now = Utc::now();
        let bill = document(&a, date(1, 3), dec!(2), dec!(10));
        let id = submit(&db, &a, ReferenceType::Bill, Action::Create, Some(&bill), now).await;
        processor(&db).run_once(now).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        assert!(outbox_status(&mut *tx, b.tenant_id, ReferenceType::Bill, id).await.is_err());
        let snapshot = get_valuation(
            &mut *tx,
            &ValuationQuery {
                tenant_id: b.tenant_id,
                from: date(1, 1),
                to: date(1, 31),
                product_id: a.product_id,
                product_kind: None,
                warehouse_id: None,
            },
        )
        .await
        .unwrap();
        assert!(snapshot.details.is_empty());
        assert_eq!(snapshot.opening_source, OpeningSource::Empty);
    }
}
