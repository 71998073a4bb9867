//! Unit tests for rivven-pool error module

use rivven_pool::error::{Error, ErrorCategory};
use std::error::Error as _;

#[test]
fn test_error_connection() {
    let err = Error::connection("Failed to connect");

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.to_string().contains("Failed to connect"));
    assert!(err.is_retriable());
}

#[test]
fn test_error_connection_with_source() {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
    let err = Error::connection_with_source("Failed to connect", io);

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.source().is_some());
    assert!(err.source().unwrap().to_string().contains("refused"));
}

#[test]
fn test_error_timeout() {
    let err = Error::timeout("waited 30000ms");

    assert_eq!(err.category(), ErrorCategory::Timeout);
    assert!(err.to_string().starts_with("timeout:"));
    assert!(err.is_retriable());
}

#[test]
fn test_error_config() {
    let err = Error::config("minimum exceeds maximum");

    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("minimum exceeds maximum"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_double_release() {
    let err = Error::double_release("connection [id=3] has already been released");

    assert_eq!(err.category(), ErrorCategory::Ownership);
    assert!(err.to_string().contains("id=3"));
    assert!(!err.is_retriable());
}

#[test]
fn test_error_validation() {
    let err = Error::validation("check rejected");

    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(!err.is_retriable());
}

#[test]
fn test_error_resource() {
    let err = Error::resource("broken pipe");

    assert_eq!(err.category(), ErrorCategory::Resource);
    assert!(err.source().is_none());
    assert!(!err.is_retriable());
}

#[test]
fn test_error_pool_closed() {
    let err = Error::PoolClosed;

    assert_eq!(err.category(), ErrorCategory::Closed);
    assert_eq!(err.to_string(), "pool closed");
}

#[test]
fn test_error_internal() {
    let err = Error::internal("unexpected state");

    assert_eq!(err.category(), ErrorCategory::Other);
    assert!(err.to_string().contains("unexpected state"));
}

#[test]
fn test_error_category_display() {
    assert_eq!(ErrorCategory::Connection.to_string(), "connection");
    assert_eq!(ErrorCategory::Ownership.to_string(), "ownership");
    assert_eq!(ErrorCategory::Closed.to_string(), "closed");
}
