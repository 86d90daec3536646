mod support;

use escrow_core::Role;
use escrow_engine::DealEvent;
use support::*;

#[tokio::test]
async fn creation_reaches_seller_and_arbiters() {
    let mut h = harness();
    h.engine
        .create_deal(&account(BUYER), panel_proposal("deal-notify", 40, 2))
        .await
        .expect("deal should be created");

    let delivered = h.drain_deliveries().await;
    assert!(delivered.iter().all(|n| n.event == DealEvent::Created));
    let mut recipients: Vec<String> = delivered.iter().map(|n| n.recipient.to_string()).collect();
    recipients.sort();
    assert_eq!(recipients, vec![SELLER, PANEL[0], PANEL[1], PANEL[2]]);
    assert!(delivered.iter().all(|n| n.email.ends_with("@example.test")));
}

#[tokio::test]
async fn recipients_without_contact_are_skipped() {
    let mut h = harness_with(HarnessOptions {
        unreachable_contacts: vec![SELLER],
        ..HarnessOptions::default()
    });
    let id = h
        .engine
        .create_deal(&account(BUYER), single_arbiter_proposal("deal-quiet", 40))
        .await
        .expect("deal should be created")
        .deal_id;
    h.drain_deliveries().await;

    h.engine
        .accept_as_arbiter(&id, &account(ARBITER))
        .await
        .expect("arbiter should accept");

    let delivered = h.drain_deliveries().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].recipient_role, Role::Buyer);
    assert_eq!(delivered[0].event, DealEvent::ArbiterAccepted);
}

#[tokio::test]
async fn failed_writes_notify_nobody() {
    let mut h = harness();
    let id = h
        .engine
        .create_deal(&account(BUYER), single_arbiter_proposal("deal-silent", 40))
        .await
        .expect("deal should be created")
        .deal_id;
    h.drain_deliveries().await;

    h.engine
        .fund_deal(&id, &account(BUYER), 40)
        .await
        .expect_err("funding before acceptance should fail");

    assert!(h.drain_deliveries().await.is_empty());
}
