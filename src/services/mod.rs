pub mod dispatcher;
pub mod storage;
pub mod transfer;
pub mod upload_service;
