mod common;

use std::sync::Arc;
use std::time::Duration;

use common::stub::StubServer;
use common::HOLD;
use paylock::{
    ActuationError, CredentialCache, LockActuator, LockState, LockStateMachine, StateError,
    TtlockActuator, TtlockTokenExchange, VendorCredentials,
};

const TOKEN: &str = "/oauth2/token";
const UNLOCK: &str = "/v3/lock/unlock";

fn token_body(token: &str) -> String {
    format!(r#"{{"access_token":"{token}","expires_in":7776000}}"#)
}

fn vendor(stub: &StubServer) -> TtlockActuator {
    let http = reqwest::Client::new();
    let exchange = TtlockTokenExchange::new(
        http.clone(),
        stub.url(),
        VendorCredentials::new("client-1", "secret", "owner@example.com", "pw"),
        Duration::from_secs(2),
    );
    TtlockActuator::new(
        http,
        stub.url(),
        "client-1",
        Arc::new(CredentialCache::new(exchange)),
        Duration::from_secs(2),
    )
}

#[actix_rt::test]
async fn test_rejected_token_is_replaced_and_command_retried_once() {
    let stub = StubServer::start();
    stub.reply(TOKEN, 200, &token_body("tok-1"))
        .reply(TOKEN, 200, &token_body("tok-2"));
    stub.reply(UNLOCK, 200, r#"{"errcode":10004,"errmsg":"invalid grant"}"#)
        .reply(UNLOCK, 200, r#"{"errcode":0,"errmsg":"none error message"}"#);

    let actuator = vendor(&stub);
    actuator.unlock("lock-1").await.unwrap();

    assert_eq!(stub.hits(TOKEN).len(), 2);
    let unlocks = stub.hits(UNLOCK);
    assert_eq!(unlocks.len(), 2);
    assert!(unlocks[0].body.contains("accessToken=tok-1"));
    assert!(unlocks[1].body.contains("accessToken=tok-2"));
    assert!(unlocks[1].body.contains("clientId=client-1"));
    assert!(unlocks[1].body.contains("lockId=lock-1"));
    assert_eq!(actuator.credentials().status().as_str(), "cached");
}

#[actix_rt::test]
async fn test_second_token_rejection_gives_up() {
    let stub = StubServer::start();
    stub.reply(TOKEN, 200, &token_body("tok-1"))
        .reply(TOKEN, 200, &token_body("tok-2"));
    stub.reply(UNLOCK, 200, r#"{"errcode":10003,"errmsg":"invalid token"}"#);

    let actuator = vendor(&stub);
    let e = actuator.unlock("lock-1").await.unwrap_err();

    assert_eq!(e.code, 10003);
    assert_eq!(stub.hits(UNLOCK).len(), 2);
    assert_eq!(stub.hits(TOKEN).len(), 2);
    assert_eq!(actuator.credentials().status().as_str(), "empty");
}

#[actix_rt::test]
async fn test_vendor_failure_is_not_retried() {
    let stub = StubServer::start();
    stub.reply(TOKEN, 200, &token_body("tok-1"));
    stub.reply(UNLOCK, 200, r#"{"errcode":-3003,"errmsg":"gateway busy"}"#);

    let actuator = vendor(&stub);
    let e = actuator.unlock("lock-1").await.unwrap_err();

    assert_eq!(e.code, -3003);
    assert_eq!(e.message, "gateway busy");
    assert_eq!(stub.hits(UNLOCK).len(), 1);
    assert_eq!(stub.hits(TOKEN).len(), 1);
    assert_eq!(actuator.credentials().status().as_str(), "cached");
}

#[actix_rt::test]
async fn test_token_endpoint_error_is_retried_once() {
    let stub = StubServer::start();
    stub.reply(TOKEN, 502, "bad gateway")
        .reply(TOKEN, 200, &token_body("tok-1"));
    stub.reply(UNLOCK, 200, r#"{"errcode":0}"#);

    let actuator = vendor(&stub);
    actuator.unlock("lock-1").await.unwrap();

    assert_eq!(stub.hits(TOKEN).len(), 2);
    assert_eq!(stub.hits(UNLOCK).len(), 1);
}

#[actix_rt::test]
async fn test_vendor_http_error_is_final() {
    let stub = StubServer::start();
    stub.reply(TOKEN, 200, &token_body("tok-1"));
    stub.reply(UNLOCK, 503, "");

    let actuator = vendor(&stub);
    let e = actuator.unlock("lock-1").await.unwrap_err();

    assert_eq!(e.code, ActuationError::HTTP);
    assert_eq!(stub.hits(UNLOCK).len(), 1);
}

#[actix_rt::test]
async fn test_out_of_range_token_lifetime_leaves_lock_usable() {
    let stub = StubServer::start();
    stub.reply(
        TOKEN,
        200,
        r#"{"access_token":"t","expires_in":18446744073709551615}"#,
    );
    stub.reply(UNLOCK, 200, r#"{"errcode":0}"#);

    let machine = LockStateMachine::new("lock-1", vendor(&stub));

    let first = machine.request_open(HOLD).await.unwrap_err();
    assert!(matches!(first, StateError::Actuation(ref e) if e.code == ActuationError::AUTH));
    assert_eq!(machine.state(), LockState::Closed);
    assert!(stub.hits(UNLOCK).is_empty());

    // Still Closed, so the next open is attempted rather than refused.
    let second = machine.request_open(HOLD).await.unwrap_err();
    assert!(matches!(second, StateError::Actuation(_)));
    assert_eq!(machine.state(), LockState::Closed);

    stub.set_reply(TOKEN, 200, &token_body("tok-ok"));
    machine.request_open(HOLD).await.unwrap();
    assert_eq!(machine.state(), LockState::Open);
    assert_eq!(stub.hits(UNLOCK).len(), 1);
}
