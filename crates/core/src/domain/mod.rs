pub mod access;
pub mod conversation;
pub mod employee;
pub mod sales;
