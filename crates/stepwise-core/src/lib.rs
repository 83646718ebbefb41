//! Orchestration kernel for Stepwise.
//!
//! This crate holds the execution engine (executor, worker, guardrails,
//! checkpoints, ledger) and defines the "ports" (storage and collaborator
//! traits) that outside code implements. It depends only on
//! `stepwise-types` -- never on `stepwise-infra` or any database crate.

pub mod event;
pub mod llm;
pub mod repository;
pub mod storage;
pub mod tool;
pub mod workflow;
