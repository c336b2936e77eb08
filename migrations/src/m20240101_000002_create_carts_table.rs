use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Carts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Carts::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Carts::UserId).uuid().not_null())
                    .col(
                        ColumnDef::new(Carts::TotalAmount)
                            .decimal_len(16, 4)
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Carts::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Carts::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // One cart per user; concurrent first accesses race on this index
        // and the loser re-selects the winner's row.
        manager
            .create_index(
                Index::create()
                    .name("idx_carts_user_id")
                    .table(Carts::Table)
                    .col(Carts::UserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Carts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Carts {
    Table,
    Id,
    UserId,
    TotalAmount,
    CreatedAt,
    UpdatedAt,
}
