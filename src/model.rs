use candle_core::{Device, IndexOp, Result, Tensor, D};
use candle_nn::{
    embedding, layer_norm, linear, linear_no_bias, Dropout, Embedding, LayerNorm, LayerNormConfig,
    Linear, Module, ModuleT, VarBuilder,
};

#[cfg(feature = "metal")]
use candle_nn::ops::softmax;

#[cfg(not(feature = "metal"))]
use candle_nn::ops::softmax_last_dim;

use crate::utils::{causal_mask, masked_fill};

fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    dropout: Option<&Dropout>,
    train: bool,
) -> Result<(Tensor, Tensor)> {
    let head_size = *q.dims().last().unwrap();
    let scale_factor = Tensor::new((head_size as f32).sqrt(), q.device())?.to_dtype(q.dtype())?;

    // (batch, heads, q_len, k_len)
    let attention_scores = q.matmul(&k.t()?)?.broadcast_div(&scale_factor)?;
    let attention_scores = match mask {
        Some(m) => masked_fill(&attention_scores, m)?,
        None => attention_scores,
    };

    #[cfg(not(feature = "metal"))]
    let attention_weights = softmax_last_dim(&attention_scores)?;

    #[cfg(feature = "metal")]
    let attention_weights = softmax(&attention_scores, D::Minus1)?;

    let attention_weights = match dropout {
        Some(d) => d.forward(&attention_weights, train)?,
        None => attention_weights,
    };

    // (batch, heads, q_len, head_size)
    let attention_output = attention_weights.matmul(v)?;
    Ok((attention_output, attention_weights))
}

pub struct MultiHeadAttention {
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_o: Linear,
    dropout: Dropout,
    num_heads: usize,
    head_size: usize,
}

impl MultiHeadAttention {
    pub fn new(d_model: usize, num_heads: usize, drop_p: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_q: linear_no_bias(d_model, d_model, vb.pp("w_q"))?,
            w_k: linear_no_bias(d_model, d_model, vb.pp("w_k"))?,
            w_v: linear_no_bias(d_model, d_model, vb.pp("w_v"))?,
            w_o: linear_no_bias(d_model, d_model, vb.pp("w_o"))?,
            dropout: Dropout::new(drop_p),
            num_heads,
            head_size: d_model / num_heads,
        })
    }

    // (batch, seq_len, d_model) -> (batch, heads, seq_len, head_size)
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = xs.dims3()?;
        xs.reshape((batch_size, seq_len, self.num_heads, self.head_size))?
            .permute((0, 2, 1, 3))?
            .contiguous()
    }

    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch_size, q_len, d_model) = query.dims3()?;
        let q = self.split_heads(&self.w_q.forward(query)?)?;
        let k = self.split_heads(&self.w_k.forward(key)?)?;
        let v = self.split_heads(&self.w_v.forward(value)?)?;

        let (attention_output, _) = attention(&q, &k, &v, mask, Some(&self.dropout), train)?;

        attention_output
            .transpose(1, 2)? // (batch, q_len, heads, head_size)
            .contiguous()?
            .reshape((batch_size, q_len, d_model))?
            .apply(&self.w_o)
    }
}

pub struct FeedForward {
    linear1: Linear,
    dropout: Dropout,
    linear2: Linear,
}

impl FeedForward {
    pub fn new(d_model: usize, d_ff: usize, drop_p: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear1: linear(d_model, d_ff, vb.pp("ff_linear1"))?,
            dropout: Dropout::new(drop_p),
            linear2: linear(d_ff, d_model, vb.pp("ff_linear2"))?,
        })
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply(&self.linear1)?
            .relu()?
            .apply_t(&self.dropout, train)?
            .apply(&self.linear2)
    }
}

/// Token embedding scaled by sqrt(d_model).
pub struct InputEmbedding {
    scale_factor: Tensor,
    embedding: Embedding,
}

impl InputEmbedding {
    pub fn new(vocab_size: usize, d_model: usize, vb: VarBuilder) -> Result<Self> {
        let scale_factor = Tensor::new((d_model as f32).sqrt(), vb.device())?;
        let embedding = embedding(vocab_size, d_model, vb.pp("wte"))?;
        Ok(Self {
            scale_factor,
            embedding,
        })
    }
}

impl Module for InputEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // (batch, seq_len) -> (batch, seq_len, d_model)
        self.embedding
            .forward(xs)?
            .broadcast_mul(&self.scale_factor)
    }
}

/// Fixed sinusoidal positional table, sin/cos interleaved, plus dropout.
pub struct PositionalEncoding {
    table: Tensor,
    dropout: Dropout,
}

impl PositionalEncoding {
    pub fn new(max_len: usize, d_model: usize, drop_p: f32, vb: VarBuilder) -> Result<Self> {
        let device = vb.device();
        let dtype = vb.dtype();
        let half_d_model = d_model / 2;

        // 10_000^(-2i / d_model) = exp(-2i * ln(10_000) / d_model)
        let div_term = (Tensor::arange(0., half_d_model as f32, device)?
            * (-2. * (10_000f64.ln() / d_model as f64)))?
            .exp()?
            .to_dtype(dtype)?
            .reshape((1, half_d_model))?;
        let pos = Tensor::arange(0., max_len as f32, device)?
            .to_dtype(dtype)?
            .reshape((max_len, 1))?;

        let angles = pos.matmul(&div_term)?;
        let table = Tensor::stack(&[&angles.sin()?, &angles.cos()?], 2)?
            .reshape((max_len, d_model))?
            .contiguous()?
            .unsqueeze(0)?; // (1, max_len, d_model)

        Ok(Self {
            table,
            dropout: Dropout::new(drop_p),
        })
    }
}

impl ModuleT for PositionalEncoding {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq_len, _) = xs.dims3()?;
        let xs = xs.broadcast_add(&self.table.i((.., ..seq_len, ..))?)?;
        self.dropout.forward(&xs, train)
    }
}

/// Pre-norm residual encoder block: self-attention then feed-forward.
pub struct EncoderBlock {
    self_attention: MultiHeadAttention,
    feed_forward: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dropout: Dropout,
}

impl EncoderBlock {
    pub fn new(
        d_model: usize,
        num_heads: usize,
        d_ff: usize,
        drop_p: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attention: MultiHeadAttention::new(
                d_model,
                num_heads,
                drop_p,
                vb.pp("self_attention"),
            )?,
            feed_forward: FeedForward::new(d_model, d_ff, drop_p, vb.pp("feed_forward"))?,
            norm1: layer_norm(d_model, LayerNormConfig::default(), vb.pp("norm1"))?,
            norm2: layer_norm(d_model, LayerNormConfig::default(), vb.pp("norm2"))?,
            dropout: Dropout::new(drop_p),
        })
    }

    pub fn forward(&self, xs: &Tensor, src_mask: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.norm1.forward(xs)?;
        let attn = self
            .self_attention
            .forward(&normed, &normed, &normed, Some(src_mask), train)?;
        let xs = xs.add(&self.dropout.forward(&attn, train)?)?;

        let ff = self
            .feed_forward
            .forward_t(&self.norm2.forward(&xs)?, train)?;
        xs.add(&self.dropout.forward(&ff, train)?)
    }
}

/// Pre-norm residual decoder block: masked self-attention, cross-attention
/// over the encoder output, then feed-forward.
pub struct DecoderBlock {
    self_attention: MultiHeadAttention,
    cross_attention: MultiHeadAttention,
    feed_forward: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    dropout: Dropout,
}

impl DecoderBlock {
    pub fn new(
        d_model: usize,
        num_heads: usize,
        d_ff: usize,
        drop_p: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attention: MultiHeadAttention::new(
                d_model,
                num_heads,
                drop_p,
                vb.pp("self_attention"),
            )?,
            cross_attention: MultiHeadAttention::new(
                d_model,
                num_heads,
                drop_p,
                vb.pp("cross_attention"),
            )?,
            feed_forward: FeedForward::new(d_model, d_ff, drop_p, vb.pp("feed_forward"))?,
            norm1: layer_norm(d_model, LayerNormConfig::default(), vb.pp("norm1"))?,
            norm2: layer_norm(d_model, LayerNormConfig::default(), vb.pp("norm2"))?,
            norm3: layer_norm(d_model, LayerNormConfig::default(), vb.pp("norm3"))?,
            dropout: Dropout::new(drop_p),
        })
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        encoder_output: &Tensor,
        src_mask: &Tensor,
        tgt_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let normed = self.norm1.forward(xs)?;
        let attn = self
            .self_attention
            .forward(&normed, &normed, &normed, Some(tgt_mask), train)?;
        let xs = xs.add(&self.dropout.forward(&attn, train)?)?;

        let normed = self.norm2.forward(&xs)?;
        let cross = self.cross_attention.forward(
            &normed,
            encoder_output,
            encoder_output,
            Some(src_mask),
            train,
        )?;
        let xs = xs.add(&self.dropout.forward(&cross, train)?)?;

        let ff = self
            .feed_forward
            .forward_t(&self.norm3.forward(&xs)?, train)?;
        xs.add(&self.dropout.forward(&ff, train)?)
    }
}

/// Encoder-decoder translation transformer. Everything needed by the
/// training loop surfaces as `encode`, `decode` and `project`.
pub struct Translator {
    src_embed: InputEmbedding,
    tgt_embed: InputEmbedding,
    src_pos: PositionalEncoding,
    tgt_pos: PositionalEncoding,
    encoder_blocks: Vec<EncoderBlock>,
    decoder_blocks: Vec<DecoderBlock>,
    encoder_norm: LayerNorm,
    decoder_norm: LayerNorm,
    projection: Linear,
}

impl Translator {
    pub fn encode(&self, src: &Tensor, src_mask: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self
            .src_pos
            .forward_t(&self.src_embed.forward(src)?, train)?;
        for block in &self.encoder_blocks {
            xs = block.forward(&xs, src_mask, train)?;
        }
        self.encoder_norm.forward(&xs)
    }

    pub fn decode(
        &self,
        encoder_output: &Tensor,
        src_mask: &Tensor,
        tgt: &Tensor,
        tgt_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let mut xs = self
            .tgt_pos
            .forward_t(&self.tgt_embed.forward(tgt)?, train)?;
        for block in &self.decoder_blocks {
            xs = block.forward(&xs, encoder_output, src_mask, tgt_mask, train)?;
        }
        self.decoder_norm.forward(&xs)
    }

    pub fn project(&self, xs: &Tensor) -> Result<Tensor> {
        // (batch, seq_len, d_model) -> (batch, seq_len, tgt_vocab_size)
        self.projection.forward(xs)
    }
}

#[allow(clippy::too_many_arguments)]
pub fn translator(
    src_vocab_size: usize,
    tgt_vocab_size: usize,
    max_len: usize,
    d_model: usize,
    num_blocks: usize,
    num_heads: usize,
    drop_p: f32,
    d_ff: usize,
    vb: VarBuilder,
) -> Result<Translator> {
    let encoder_blocks = (0..num_blocks)
        .map(|i| {
            EncoderBlock::new(
                d_model,
                num_heads,
                d_ff,
                drop_p,
                vb.pp(format!("encoder_block_{i}")),
            )
        })
        .collect::<Result<Vec<_>>>()?;
    let decoder_blocks = (0..num_blocks)
        .map(|i| {
            DecoderBlock::new(
                d_model,
                num_heads,
                d_ff,
                drop_p,
                vb.pp(format!("decoder_block_{i}")),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Translator {
        src_embed: InputEmbedding::new(src_vocab_size, d_model, vb.pp("src_embed"))?,
        tgt_embed: InputEmbedding::new(tgt_vocab_size, d_model, vb.pp("tgt_embed"))?,
        src_pos: PositionalEncoding::new(max_len, d_model, drop_p, vb.pp("src_pos"))?,
        tgt_pos: PositionalEncoding::new(max_len, d_model, drop_p, vb.pp("tgt_pos"))?,
        encoder_blocks,
        decoder_blocks,
        encoder_norm: layer_norm(d_model, LayerNormConfig::default(), vb.pp("encoder_norm"))?,
        decoder_norm: layer_norm(d_model, LayerNormConfig::default(), vb.pp("decoder_norm"))?,
        projection: linear(d_model, tgt_vocab_size, vb.pp("projection"))?,
    })
}

/// Greedy decoding of a single source sequence: pick the argmax token at
/// every step, stop at `[EOS]` or the length cutoff. No beam search.
pub fn greedy_decode(
    model: &Translator,
    src: &Tensor,
    src_mask: &Tensor,
    sos_id: u32,
    eos_id: u32,
    max_tokens: usize,
    device: &Device,
) -> Result<Tensor> {
    let encoder_output = model.encode(src, src_mask, false)?; // (1, src_len, d_model)
    let mut decoder_input = Tensor::new(sos_id, device)?.reshape((1, 1))?;

    while decoder_input.dims()[1] < max_tokens {
        let decoder_mask = causal_mask(decoder_input.dims()[1], device)?;
        let decoder_output = model.decode(
            &encoder_output,
            src_mask,
            &decoder_input,
            &decoder_mask,
            false,
        )?;
        let last = decoder_output.i((.., decoder_output.dims()[1] - 1.., ..))?;
        let next_word = model
            .project(&last)?
            .argmax(D::Minus1)?
            .squeeze(0)?
            .squeeze(0)?
            .to_vec0::<u32>()?;

        decoder_input = Tensor::cat(
            &[&decoder_input, &Tensor::new(next_word, device)?.reshape((1, 1))?],
            1,
        )?;
        if next_word == eos_id {
            break;
        }
    }
    Ok(decoder_input) // (1, generated_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_model(device: &Device) -> Translator {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        translator(12, 14, 16, 8, 1, 2, 0.0, 16, vb).unwrap()
    }

    #[test]
    fn test_encode_decode_project_shapes() {
        let device = Device::Cpu;
        let model = tiny_model(&device);

        let (batch_size, src_len, tgt_len) = (2, 5, 4);
        let src = Tensor::zeros((batch_size, src_len), DType::U32, &device).unwrap();
        let tgt = Tensor::zeros((batch_size, tgt_len), DType::U32, &device).unwrap();
        let src_mask = Tensor::ones((batch_size, 1, 1, src_len), DType::U8, &device).unwrap();
        let tgt_mask = causal_mask(tgt_len, &device).unwrap().unsqueeze(0).unwrap();

        let encoder_output = model.encode(&src, &src_mask, false).unwrap();
        assert_eq!(encoder_output.dims(), &[batch_size, src_len, 8]);

        let decoder_output = model
            .decode(&encoder_output, &src_mask, &tgt, &tgt_mask, false)
            .unwrap();
        assert_eq!(decoder_output.dims(), &[batch_size, tgt_len, 8]);

        let logits = model.project(&decoder_output).unwrap();
        assert_eq!(logits.dims(), &[batch_size, tgt_len, 14]);
    }

    #[test]
    fn test_greedy_decode_is_bounded() {
        let device = Device::Cpu;
        let model = tiny_model(&device);

        let src = Tensor::zeros((1, 5), DType::U32, &device).unwrap();
        let src_mask = Tensor::ones((1, 1, 1, 5), DType::U8, &device).unwrap();

        let max_tokens = 8;
        let out = greedy_decode(&model, &src, &src_mask, 2, 3, max_tokens, &device).unwrap();
        assert_eq!(out.dims()[0], 1);
        assert!(out.dims()[1] <= max_tokens + 1);
        assert_eq!(out.i((0, 0)).unwrap().to_vec0::<u32>().unwrap(), 2);
    }

    #[test]
    fn test_positional_table_values_in_range() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pos = PositionalEncoding::new(10, 8, 0.0, vb).unwrap();
        let values = pos.table.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|x| (-1. ..=1.).contains(x)));
    }
}
