diesel::table! {
    inventory (product_id) {
        product_id -> Int8,
        quantity -> Int4,
        version -> Int8,
        deleted_at -> Nullable<Timestamptz>,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    adjustment_batches (idempotency_key) {
        idempotency_key -> Varchar,
        status -> Varchar,
        adjustments -> Jsonb,
        results -> Jsonb,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    inventory,
    adjustment_batches,
);
