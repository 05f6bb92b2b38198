//! # repo-compare core
//!
//! Runtime-agnostic logic for repo-compare: data models, query
//! normalization, trigram similarity, synonym expansion, relevance scoring,
//! model pricing, the store abstraction, the embedding trait, and category
//! resolution.
//!
//! This crate has no tokio, sqlx, or HTTP dependencies. The `repo-compare`
//! application crate supplies the SQLite store and the network clients.

pub mod category;
pub mod embedding;
pub mod models;
pub mod normalize;
pub mod pricing;
pub mod relevance;
pub mod similarity;
pub mod store;
pub mod synonyms;
