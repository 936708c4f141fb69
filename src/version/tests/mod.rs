mod helpers;
mod tests_version;
