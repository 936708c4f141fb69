mod tests_codec;
mod tests_limits;
