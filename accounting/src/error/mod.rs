mod accounting_error;

pub use accounting_error::AccountingError;
pub type Result<T> = std::result::Result<T, AccountingError>;
