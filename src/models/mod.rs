pub mod token_record;
