// 🧩 Source relations and mart definitions
// A mart is described as data: a base raw table, its joins, the projection into
// the mart's columns, and the key that identifies a mart row. SQL is rendered
// from that description so the gap analyzer and the refresher always agree on
// what "the source" means.

// ============================================================================
// RELATION MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `left = right`
    Eq(&'static str, &'static str),
    /// `column IS NOT NULL`
    NotNull(&'static str),
    /// `from <= at AND (to IS NULL OR to >= at)`; an open-ended `to` is valid
    ValidOn {
        from: &'static str,
        to: &'static str,
        at: &'static str,
    },
}

impl Condition {
    fn render(&self) -> String {
        match self {
            Condition::Eq(left, right) => format!("{} = {}", left, right),
            Condition::NotNull(column) => format!("{} IS NOT NULL", column),
            Condition::ValidOn { from, to, at } => {
                format!("{from} <= {at} AND ({to} IS NULL OR {to} >= {at})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: &'static str,
    pub alias: &'static str,
    pub on: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(&'static str),
    /// `COALESCE(column, 'literal')`
    CoalesceText(&'static str, &'static str),
}

impl Expr {
    fn render(&self) -> String {
        match self {
            Expr::Column(column) => column.to_string(),
            Expr::CoalesceText(column, fallback) => {
                format!("COALESCE({}, '{}')", column, fallback.replace('\'', "''"))
            }
        }
    }
}

/// One mart column and the source expression feeding it
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub name: &'static str,
    pub expr: Expr,
}

fn col(name: &'static str, source: &'static str) -> Projection {
    Projection {
        name,
        expr: Expr::Column(source),
    }
}

/// A virtual row set joined from raw tables. Never materialized by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRelation {
    pub table: &'static str,
    pub alias: &'static str,
    pub joins: Vec<Join>,
    pub projection: Vec<Projection>,
    pub filters: Vec<Condition>,
}

impl SourceRelation {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.projection.iter().map(|p| p.name).collect()
    }

    pub fn to_sql(&self) -> String {
        let select: Vec<String> = self
            .projection
            .iter()
            .map(|p| format!("{} AS {}", p.expr.render(), p.name))
            .collect();

        let mut sql = format!(
            "SELECT {} FROM {} {}",
            select.join(", "),
            self.table,
            self.alias
        );

        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let on: Vec<String> = join.on.iter().map(Condition::render).collect();
            sql.push_str(&format!(
                " {} {} {} ON {}",
                kind,
                join.table,
                join.alias,
                on.join(" AND ")
            ));
        }

        if !self.filters.is_empty() {
            let filters: Vec<String> = self.filters.iter().map(Condition::render).collect();
            sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
        }

        sql
    }
}

// ============================================================================
// MART DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MartDefinition {
    pub name: &'static str,
    /// Materialized table
    pub target: &'static str,
    /// Mart columns identifying a row, matched between source and target
    pub key: &'static [&'static str],
    pub source: SourceRelation,
}

impl MartDefinition {
    pub fn column_list(&self) -> String {
        self.source.column_names().join(", ")
    }

    /// Null-safe key match between two aliases
    pub fn key_match(&self, source_alias: &str, target_alias: &str) -> String {
        self.key
            .iter()
            .map(|k| format!("{t}.{k} IS {s}.{k}", t = target_alias, s = source_alias, k = k))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Source rows whose key is absent from the target
    pub fn missing_rows_sql(&self) -> String {
        format!(
            "SELECT s.* FROM ({source}) s WHERE NOT EXISTS (SELECT 1 FROM {target} t WHERE {matched})",
            source = self.source.to_sql(),
            target = self.target,
            matched = self.key_match("s", "t"),
        )
    }

    pub fn by_name(name: &str) -> Option<MartDefinition> {
        builtin_marts().into_iter().find(|m| m.name == name)
    }
}

// ============================================================================
// BUILT-IN MARTS
// ============================================================================

pub fn builtin_marts() -> Vec<MartDefinition> {
    vec![loan_holiday_info(), account_balance_turnover()]
}

/// Deals with their product and loan holiday terms
pub fn loan_holiday_info() -> MartDefinition {
    MartDefinition {
        name: "loan_holiday_info",
        target: "dm_loan_holiday_info",
        key: &["deal_rk", "effective_from_date"],
        source: SourceRelation {
            table: "rd_deal",
            alias: "d",
            joins: vec![
                Join {
                    kind: JoinKind::Left,
                    table: "rd_loan_holiday",
                    alias: "lh",
                    on: vec![Condition::Eq("d.deal_rk", "lh.deal_rk")],
                },
                Join {
                    kind: JoinKind::Left,
                    table: "rd_product",
                    alias: "p",
                    on: vec![Condition::Eq("d.product_rk", "p.product_rk")],
                },
            ],
            projection: vec![
                col("deal_rk", "d.deal_rk"),
                col("effective_from_date", "d.effective_from_date"),
                col("effective_to_date", "d.effective_to_date"),
                col("agreement_rk", "d.agreement_rk"),
                col("client_rk", "d.client_rk"),
                col("department_rk", "d.department_rk"),
                col("product_rk", "d.product_rk"),
                col("product_name", "p.product_name"),
                col("deal_type_cd", "d.deal_type_cd"),
                col("deal_start_date", "d.deal_start_date"),
                col("deal_name", "d.deal_name"),
                col("deal_number", "d.deal_num"),
                col("deal_sum", "d.deal_sum"),
                col("loan_holiday_type_cd", "lh.loan_holiday_type_cd"),
                col("loan_holiday_start_date", "lh.loan_holiday_start_date"),
                col("loan_holiday_finish_date", "lh.loan_holiday_finish_date"),
                col("loan_holiday_fact_finish_date", "lh.loan_holiday_fact_finish_date"),
                col("loan_holiday_finish_flg", "lh.loan_holiday_finish_flg"),
                col("loan_holiday_last_possible_date", "lh.loan_holiday_last_possible_date"),
            ],
            filters: vec![],
        },
    }
}

/// Daily account balances with currency name and department
pub fn account_balance_turnover() -> MartDefinition {
    MartDefinition {
        name: "account_balance_turnover",
        target: "dm_account_balance_turnover",
        key: &["account_rk", "effective_date"],
        source: SourceRelation {
            table: "rd_account_balance",
            alias: "ab",
            joins: vec![
                Join {
                    kind: JoinKind::Inner,
                    table: "rd_account",
                    alias: "a",
                    on: vec![Condition::Eq("ab.account_rk", "a.account_rk")],
                },
                Join {
                    kind: JoinKind::Left,
                    table: "dm_dict_currency",
                    alias: "dc",
                    on: vec![
                        Condition::Eq("a.currency_cd", "dc.currency_cd"),
                        Condition::ValidOn {
                            from: "dc.effective_from_date",
                            to: "dc.effective_to_date",
                            at: "ab.effective_date",
                        },
                    ],
                },
            ],
            projection: vec![
                col("account_rk", "ab.account_rk"),
                Projection {
                    name: "currency_name",
                    expr: Expr::CoalesceText("dc.currency_name", "-1"),
                },
                col("department_rk", "a.department_rk"),
                col("effective_date", "ab.effective_date"),
                col("account_in_sum", "ab.account_in_sum"),
                col("account_out_sum", "ab.account_out_sum"),
            ],
            filters: vec![
                Condition::NotNull("ab.account_in_sum"),
                Condition::NotNull("ab.account_out_sum"),
            ],
        },
    }
}

// ============================================================================
// TESTS
// ============================================================================
