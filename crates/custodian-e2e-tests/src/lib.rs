//! End-to-end integration tests for Custodian.
//!
//! These tests exercise the crates together:
//! - Backup, encryption, multi-region replication and verification
//! - Retention sweeps over a populated catalog
//! - Credential rotation, grace windows and rollback
//! - Workflow locking
//! - The orchestrated `run` against a local service and a fake `pg_dump`

#![cfg(test)]
