mod common;
mod event_store_tests;
