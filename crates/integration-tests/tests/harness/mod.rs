#![allow(dead_code)]

pub mod chat;
pub mod config;
pub mod mock_llm;
