pub mod helpers;

mod tests_concurrency;
mod tests_recovery;
mod tests_write;
