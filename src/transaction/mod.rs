pub mod concurrency;

pub use concurrency::{
    IsolationLevel, LockManager, LockMode, Transaction, TransactionAbortError, TransactionManager,
    TransactionState,
};
