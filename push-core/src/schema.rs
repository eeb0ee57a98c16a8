use diesel::table;

table! {
    device_tokens (id) {
        id -> BigInt,
        user_id -> BigInt,
        token -> Text,
        platform -> Text,
        device_info -> Nullable<Jsonb>,
        is_active -> Bool,
        last_used_at -> Timestamptz,
        failure_count -> Integer,
        last_failure_at -> Nullable<Timestamptz>,
        failure_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
